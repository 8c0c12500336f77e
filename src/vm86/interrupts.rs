//! IVT-driven interrupt injection.
//!
//! `do_int` replicates what the CPU does natively for `INT n` in real mode:
//! push FLAGS/CS/IP, then load CS:IP from the IVT. The kernel's VM86 monitor
//! does this for us only when a vector is marked revectored; every vector
//! the supervisor owns (none are revectored here except to force 0xE7 to
//! always trap) lands back in userspace instead, so the supervisor performs
//! the push-and-jump itself before resuming the guest.

use crate::lowmem::LowMemory;
use crate::vm86::regs::{GuestRegisters, PendingInterrupt};

/// An IVT entry: `{offset, segment}` at guest linear address `vector * 4`.
#[derive(Debug, Clone, Copy)]
pub struct IvtEntry {
    pub offset: u16,
    pub segment: u16,
}

pub fn ivt_lookup(mem: &LowMemory, vector: u8) -> IvtEntry {
    let addr = vector as u16 * 4;
    IvtEntry {
        offset: mem.peek16(0, addr),
        segment: mem.peek16(0, addr + 2),
    }
}

pub(crate) fn push16(mem: &LowMemory, regs: &mut GuestRegisters, value: u16) {
    let sp = regs.esp.lo_word().wrapping_sub(2);
    regs.esp.set_lo_word(sp);
    mem.poke16(regs.ss, sp, value);
}

pub(crate) fn pop16(mem: &LowMemory, regs: &mut GuestRegisters) -> u16 {
    let sp = regs.esp.lo_word();
    let value = mem.peek16(regs.ss, sp);
    regs.esp.set_lo_word(sp.wrapping_add(2));
    value
}

/// Push FLAGS/CS/IP and jump to `IVT[vector]`.
pub fn do_int(mem: &LowMemory, regs: &mut GuestRegisters, vector: u8) {
    push16(mem, regs, regs.eflags.lo_word());
    push16(mem, regs, regs.cs);
    push16(mem, regs, regs.eip.lo_word());

    let entry = ivt_lookup(mem, vector);
    regs.cs = entry.segment;
    regs.eip.set_dword(entry.offset as u32);
}

/// Pop IP/CS/FLAGS, restoring the caller's context (the `IRET` opcode).
/// Returns whether this transition turned `IF` on, so the caller can
/// dispatch a pending hardware interrupt.
pub fn do_iret(mem: &LowMemory, regs: &mut GuestRegisters) -> bool {
    let was_enabled = regs.interrupts_enabled();

    let ip = pop16(mem, regs);
    let cs = pop16(mem, regs);
    let flags = pop16(mem, regs);

    regs.eip.set_dword(ip as u32);
    regs.cs = cs;
    regs.eflags.set_lo_word(flags);

    !was_enabled && regs.interrupts_enabled()
}

/// Asynchronous injection of a hardware interrupt: deliver now if `IF` is
/// set, otherwise hold it in the one-slot pending register.
pub fn vm86_interrupt(
    mem: &LowMemory,
    regs: &mut GuestRegisters,
    pending: &mut PendingInterrupt,
    vector: u8,
) {
    if regs.interrupts_enabled() {
        do_int(mem, regs, vector);
    } else {
        pending.arm(vector);
    }
}

/// Deliver the pending interrupt, if any and if `IF` is now set.
pub fn dispatch_pending(mem: &LowMemory, regs: &mut GuestRegisters, pending: &mut PendingInterrupt) {
    if !regs.interrupts_enabled() {
        return;
    }
    if let Some(vector) = pending.take() {
        do_int(mem, regs, vector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm86::regs::Reg32;

    fn seeded_regs() -> GuestRegisters {
        GuestRegisters {
            cs: 0x9000,
            ss: 0x9500,
            esp: Reg32::new(0xfffe),
            eip: Reg32::new(0x0050),
            eflags: Reg32::new(0x0202),
            ..Default::default()
        }
    }

    #[test]
    fn do_int_jumps_to_ivt_entry() {
        let mem = LowMemory::anonymous();
        mem.poke16(0, 0x21 * 4, 0x1234); // offset
        mem.poke16(0, 0x21 * 4 + 2, 0xf000); // segment

        let mut regs = seeded_regs();
        do_int(&mem, &mut regs, 0x21);

        assert_eq!(regs.cs, 0xf000);
        assert_eq!(regs.eip.lo_word(), 0x1234);
    }

    #[test]
    fn do_int_then_iret_restores_context() {
        let mem = LowMemory::anonymous();
        mem.poke16(0, 0x10 * 4, 0xabcd);
        mem.poke16(0, 0x10 * 4 + 2, 0x1000);

        let mut regs = seeded_regs();
        let (orig_cs, orig_ip, orig_flags) = (regs.cs, regs.eip.lo_word(), regs.eflags.lo_word());

        do_int(&mem, &mut regs, 0x10);
        do_iret(&mem, &mut regs);

        assert_eq!(regs.cs, orig_cs);
        assert_eq!(regs.eip.lo_word(), orig_ip);
        assert_eq!(regs.eflags.lo_word(), orig_flags);
        assert_eq!(regs.esp.lo_word(), 0xfffe);
    }

    #[test]
    fn vm86_interrupt_defers_when_if_clear() {
        let mem = LowMemory::anonymous();
        let mut regs = seeded_regs();
        regs.eflags.set_dword(0); // IF clear
        let mut pending = PendingInterrupt::default();

        vm86_interrupt(&mem, &mut regs, &mut pending, 0x09);

        assert!(pending.armed);
        assert_eq!(pending.vector, 0x09);
        assert_eq!(regs.cs, 0x9000); // unchanged, no do_int happened
    }

    #[test]
    fn dispatch_pending_delivers_once_if_set() {
        let mem = LowMemory::anonymous();
        mem.poke16(0, 0x09 * 4, 0x4444);
        mem.poke16(0, 0x09 * 4 + 2, 0x2000);

        let mut regs = seeded_regs();
        let mut pending = PendingInterrupt::default();
        pending.arm(0x09);

        dispatch_pending(&mem, &mut regs, &mut pending);

        assert_eq!(regs.cs, 0x2000);
        assert_eq!(regs.eip.lo_word(), 0x4444);
        assert!(pending.take().is_none());
    }
}
