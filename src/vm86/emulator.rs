//! Instruction emulator for the subset of x86 the kernel hands back on GPF.
//!
//! Decodes from `lin(CS,IP)`: an optional run of prefixes (`0x66` operand
//! size, `0x67` address size, `0xF3` REP), then exactly one opcode from the
//! table in the module docs. Anything else is a guest programmer error and
//! is fatal - there is no partial decode recovery.

use crate::lowmem::LowMemory;
use crate::portio::{is_whitelisted, HostIo};
use crate::vm86::interrupts::{do_int, do_iret, dispatch_pending, pop16, push16};
use crate::vm86::regs::Task;

/// Outcome of emulating one instruction.
pub enum Step {
    Continue,
    /// A guest programmer error (unknown opcode, HLT with IF=0). Carries a
    /// human-readable description; the caller is expected to call
    /// [`crate::vm86::fatal`].
    Fatal(String),
}

struct Prefixes {
    operand16: bool,
    address16: bool,
    rep: bool,
}

fn decode_prefixes(mem: &LowMemory, cs: u16, start_ip: u16) -> (Prefixes, u16) {
    let mut p = Prefixes {
        operand16: true,
        address16: true,
        rep: false,
    };
    let mut ip = start_ip;
    loop {
        match mem.peek8(cs, ip) {
            0x66 => {
                p.operand16 = false;
                ip = ip.wrapping_add(1);
            }
            0x67 => {
                p.address16 = false;
                ip = ip.wrapping_add(1);
            }
            0xf3 => {
                p.rep = true;
                ip = ip.wrapping_add(1);
            }
            _ => break,
        }
    }
    (p, ip)
}

fn rep_count(task: &Task, p: &Prefixes) -> u32 {
    if p.operand16 == p.address16 {
        task.regs.ecx.lo_word() as u32
    } else {
        task.regs.ecx.dword()
    }
}

fn set_rep_count(task: &mut Task, p: &Prefixes, value: u32) {
    if p.operand16 == p.address16 {
        task.regs.ecx.set_lo_word(value as u16);
    } else {
        task.regs.ecx.set_dword(value);
    }
}

fn get_di(task: &Task, p: &Prefixes) -> u32 {
    if p.address16 {
        task.regs.edi.lo_word() as u32
    } else {
        task.regs.edi.dword()
    }
}

fn set_di(task: &mut Task, p: &Prefixes, value: u32) {
    if p.address16 {
        task.regs.edi.set_lo_word(value as u16);
    } else {
        task.regs.edi.set_dword(value);
    }
}

fn log_io(direction: &str, port: u16, value: u32, cs: u16, ip: u16) {
    eprintln!("[IO] {direction} port={port:#06x} value={value:#x} at {cs:04x}:{ip:04x}");
}

fn routed_inb<IO: HostIo>(io: &mut IO, task: &mut Task, port: u16, cs: u16, ip: u16) -> u8 {
    match port {
        0x60 | 0x64 => task.keyboard.port_in(port),
        _ => {
            if !is_whitelisted(port) {
                log_io("IN", port, 0, cs, ip);
            }
            io.inb(port)
        }
    }
}

fn routed_outb<IO: HostIo>(io: &mut IO, task: &mut Task, port: u16, value: u8, cs: u16, ip: u16) {
    match port {
        0x60 | 0x64 => task.keyboard.port_out(port, value),
        0x20 if value == 0x20 => {} // swallow PIC EOI
        _ => {
            if !is_whitelisted(port) {
                log_io("OUT", port, value as u32, cs, ip);
            }
            io.outb(port, value);
        }
    }
}

/// Emulate one GPF'd instruction and advance the guest's IP past it.
pub fn step<IO: HostIo>(mem: &LowMemory, io: &mut IO, task: &mut Task) -> Step {
    let cs = task.regs.cs;
    let start_ip = task.regs.eip.lo_word();
    let (prefixes, after_prefixes) = decode_prefixes(mem, cs, start_ip);
    let opcode = mem.peek8(cs, after_prefixes);
    let mut ip = after_prefixes.wrapping_add(1);

    match opcode {
        0x6c => {
            // INSB: mem[ES:DI] <- inb(DX); DI += 1
            task.regs.eip.set_lo_word(ip);
            let count = if prefixes.rep { rep_count(task, &prefixes) } else { 1 };
            let dx = task.regs.edx.lo_word();
            for _ in 0..count {
                let value = routed_inb(io, task, dx, cs, ip);
                let di = get_di(task, &prefixes);
                mem.poke8(task.regs.es, di as u16, value);
                set_di(task, &prefixes, di.wrapping_add(1));
            }
            if prefixes.rep {
                set_rep_count(task, &prefixes, 0);
            }
        }
        0x6d => {
            // INSW/INSD: 2 or 4 bytes per iteration, selected by operand size.
            task.regs.eip.set_lo_word(ip);
            let count = if prefixes.rep { rep_count(task, &prefixes) } else { 1 };
            let dx = task.regs.edx.lo_word();
            let step_size: u32 = if prefixes.operand16 { 2 } else { 4 };
            for _ in 0..count {
                let di = get_di(task, &prefixes);
                if prefixes.operand16 {
                    let value = if dx == 0x60 || dx == 0x64 {
                        task.keyboard.port_in(dx) as u16
                    } else {
                        if !is_whitelisted(dx) {
                            log_io("IN", dx, 0, cs, ip);
                        }
                        io.inw(dx)
                    };
                    mem.poke16(task.regs.es, di as u16, value);
                } else {
                    let value = io.ind(dx);
                    if !is_whitelisted(dx) {
                        log_io("IN", dx, 0, cs, ip);
                    }
                    mem.poke32(task.regs.es, di as u16, value);
                }
                set_di(task, &prefixes, di.wrapping_add(step_size));
            }
            if prefixes.rep {
                set_rep_count(task, &prefixes, 0);
            }
        }
        0xcd => {
            // INT imm8
            let vector = mem.peek8(cs, ip);
            ip = ip.wrapping_add(1);
            task.regs.eip.set_lo_word(ip);
            do_int(mem, &mut task.regs, vector);
        }
        0xcf => {
            // IRET
            task.regs.eip.set_lo_word(ip);
            if do_iret(mem, &mut task.regs) {
                dispatch_pending(mem, &mut task.regs, &mut task.pending);
            }
        }
        0x9c => {
            // PUSHF
            task.regs.eip.set_lo_word(ip);
            let flags = task.regs.eflags.lo_word();
            push16(mem, &mut task.regs, flags);
        }
        0x9d => {
            // POPF
            task.regs.eip.set_lo_word(ip);
            let was_enabled = task.regs.interrupts_enabled();
            let flags = pop16(mem, &mut task.regs);
            task.regs.eflags.set_lo_word(flags);
            if !was_enabled && task.regs.interrupts_enabled() {
                dispatch_pending(mem, &mut task.regs, &mut task.pending);
            }
        }
        0xe4 => {
            let port = mem.peek8(cs, ip) as u16;
            ip = ip.wrapping_add(1);
            task.regs.eip.set_lo_word(ip);
            let value = routed_inb(io, task, port, cs, ip);
            task.regs.eax.set_lo_byte(value);
        }
        0xe5 => {
            let port = mem.peek8(cs, ip) as u16;
            ip = ip.wrapping_add(1);
            task.regs.eip.set_lo_word(ip);
            if prefixes.operand16 {
                if !is_whitelisted(port) {
                    log_io("IN", port, 0, cs, ip);
                }
                let value = io.inw(port);
                task.regs.eax.set_lo_word(value);
            } else {
                if !is_whitelisted(port) {
                    log_io("IN", port, 0, cs, ip);
                }
                let value = io.ind(port);
                task.regs.eax.set_dword(value);
            }
        }
        0xe6 => {
            let port = mem.peek8(cs, ip) as u16;
            ip = ip.wrapping_add(1);
            task.regs.eip.set_lo_word(ip);
            let value = task.regs.eax.lo_byte();
            routed_outb(io, task, port, value, cs, ip);
        }
        0xe7 => {
            let port = mem.peek8(cs, ip) as u16;
            ip = ip.wrapping_add(1);
            task.regs.eip.set_lo_word(ip);
            if prefixes.operand16 {
                let value = task.regs.eax.lo_word();
                if !is_whitelisted(port) {
                    log_io("OUT", port, value as u32, cs, ip);
                }
                io.outw(port, value);
            } else {
                let value = task.regs.eax.dword();
                if !is_whitelisted(port) {
                    log_io("OUT", port, value, cs, ip);
                }
                io.outd(port, value);
            }
        }
        0xec => {
            task.regs.eip.set_lo_word(ip);
            let port = task.regs.edx.lo_word();
            let value = routed_inb(io, task, port, cs, ip);
            task.regs.eax.set_lo_byte(value);
        }
        0xed => {
            task.regs.eip.set_lo_word(ip);
            let port = task.regs.edx.lo_word();
            if prefixes.operand16 {
                if !is_whitelisted(port) {
                    log_io("IN", port, 0, cs, ip);
                }
                let value = io.inw(port);
                task.regs.eax.set_lo_word(value);
            } else {
                if !is_whitelisted(port) {
                    log_io("IN", port, 0, cs, ip);
                }
                let value = io.ind(port);
                task.regs.eax.set_dword(value);
            }
        }
        0xee => {
            task.regs.eip.set_lo_word(ip);
            let port = task.regs.edx.lo_word();
            let value = task.regs.eax.lo_byte();
            routed_outb(io, task, port, value, cs, ip);
        }
        0xef => {
            task.regs.eip.set_lo_word(ip);
            let port = task.regs.edx.lo_word();
            if prefixes.operand16 {
                let value = task.regs.eax.lo_word();
                if !is_whitelisted(port) {
                    log_io("OUT", port, value as u32, cs, ip);
                }
                io.outw(port, value);
            } else {
                let value = task.regs.eax.dword();
                if !is_whitelisted(port) {
                    log_io("OUT", port, value, cs, ip);
                }
                io.outd(port, value);
            }
        }
        0xf4 => {
            // HLT: requires IF=1, otherwise fatal. Otherwise a no-op.
            if !task.regs.interrupts_enabled() {
                return Step::Fatal(format!(
                    "HLT with interrupts disabled at {cs:04x}:{start_ip:04x}"
                ));
            }
            task.regs.eip.set_lo_word(ip);
        }
        other => {
            return Step::Fatal(format!(
                "unknown opcode {other:#04x} at {cs:04x}:{start_ip:04x}"
            ));
        }
    }

    Step::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_abi::FLAG_IF;
    use crate::portio::test_support::FakePorts;

    fn seeded_task(cs: u16, ip: u16) -> Task {
        let mut task = Task::new(crate::vm86::regs::GuestRegisters {
            cs,
            ..Default::default()
        });
        task.regs.eip.set_lo_word(ip);
        task.regs.ss = 0x2000;
        task.regs.esp.set_lo_word(0xfffe);
        task
    }

    #[test]
    fn out_imm8_advances_ip_by_two() {
        let mem = LowMemory::anonymous();
        mem.poke8(0x1000, 0x10, 0xe6);
        mem.poke8(0x1000, 0x11, 0x80);

        let mut task = seeded_task(0x1000, 0x10);
        task.regs.eax.set_lo_byte(0x42);
        let mut io = FakePorts::default();

        step(&mem, &mut io, &mut task);

        assert_eq!(task.regs.eip.lo_word(), 0x12);
        assert_eq!(io.writes, vec![(0x80, 0x42)]);
    }

    #[test]
    fn in_dx_reads_from_host_port() {
        let mem = LowMemory::anonymous();
        mem.poke8(0x1000, 0x10, 0xec);

        let mut task = seeded_task(0x1000, 0x10);
        task.regs.edx.set_lo_word(0x3f8);
        let mut io = FakePorts {
            next_read: 0x55,
            ..Default::default()
        };

        step(&mem, &mut io, &mut task);

        assert_eq!(task.regs.eax.lo_byte(), 0x55);
        assert_eq!(task.regs.eip.lo_word(), 0x11);
    }

    #[test]
    fn rep_insw_transfers_four_words() {
        let mem = LowMemory::anonymous();
        mem.poke8(0x1000, 0x10, 0xf3);
        mem.poke8(0x1000, 0x11, 0x6d);

        let mut task = seeded_task(0x1000, 0x10);
        task.regs.edx.set_lo_word(0x1f0);
        task.regs.ecx.set_lo_word(4);
        task.regs.es = 0x2000;
        task.regs.edi.set_lo_word(0x0100);
        let mut io = FakePorts {
            next_read: 0xbeef,
            ..Default::default()
        };

        step(&mem, &mut io, &mut task);

        assert_eq!(task.regs.ecx.lo_word(), 0);
        assert_eq!(task.regs.edi.lo_word(), 0x0108);
        assert_eq!(task.regs.eip.lo_word(), 0x12);
        assert_eq!(mem.peek16(0x2000, 0x0100), 0xbeef);
        assert_eq!(mem.peek16(0x2000, 0x0106), 0xbeef);
    }

    #[test]
    fn rep_insw_with_zero_count_is_a_noop() {
        let mem = LowMemory::anonymous();
        mem.poke8(0x1000, 0x10, 0xf3);
        mem.poke8(0x1000, 0x11, 0x6d);

        let mut task = seeded_task(0x1000, 0x10);
        task.regs.ecx.set_lo_word(0);
        task.regs.edi.set_lo_word(0x0100);
        let mut io = FakePorts::default();

        step(&mem, &mut io, &mut task);

        assert_eq!(task.regs.edi.lo_word(), 0x0100);
        assert_eq!(task.regs.eip.lo_word(), 0x12);
    }

    #[test]
    fn out_20_20_is_swallowed() {
        let mem = LowMemory::anonymous();
        mem.poke8(0x1000, 0x10, 0xe6);
        mem.poke8(0x1000, 0x11, 0x20);

        let mut task = seeded_task(0x1000, 0x10);
        task.regs.eax.set_lo_byte(0x20);
        let mut io = FakePorts::default();

        step(&mem, &mut io, &mut task);

        assert!(io.writes.is_empty());
    }

    #[test]
    fn hlt_with_interrupts_disabled_is_fatal() {
        let mem = LowMemory::anonymous();
        mem.poke8(0x1000, 0x10, 0xf4);

        let mut task = seeded_task(0x1000, 0x10);
        let mut io = FakePorts::default();

        match step(&mem, &mut io, &mut task) {
            Step::Fatal(_) => {}
            Step::Continue => panic!("expected fatal"),
        }
    }

    #[test]
    fn hlt_with_interrupts_enabled_is_a_noop() {
        let mem = LowMemory::anonymous();
        mem.poke8(0x1000, 0x10, 0xf4);

        let mut task = seeded_task(0x1000, 0x10);
        task.regs.eflags.set_dword(FLAG_IF);
        let mut io = FakePorts::default();

        match step(&mem, &mut io, &mut task) {
            Step::Continue => {}
            Step::Fatal(msg) => panic!("unexpected fatal: {msg}"),
        }
        assert_eq!(task.regs.eip.lo_word(), 0x11);
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let mem = LowMemory::anonymous();
        mem.poke8(0x1000, 0x10, 0x0f); // two-byte opcode escape, unsupported

        let mut task = seeded_task(0x1000, 0x10);
        let mut io = FakePorts::default();

        match step(&mem, &mut io, &mut task) {
            Step::Fatal(_) => {}
            Step::Continue => panic!("expected fatal"),
        }
    }

    #[test]
    fn int_imm8_pushes_return_address_and_jumps() {
        let mem = LowMemory::anonymous();
        mem.poke8(0x1000, 0x10, 0xcd);
        mem.poke8(0x1000, 0x11, 0x21);
        mem.poke16(0, 0x21 * 4, 0x5678);
        mem.poke16(0, 0x21 * 4 + 2, 0xf000);

        let mut task = seeded_task(0x1000, 0x10);
        let mut io = FakePorts::default();

        step(&mem, &mut io, &mut task);

        assert_eq!(task.regs.cs, 0xf000);
        assert_eq!(task.regs.eip.lo_word(), 0x5678);
        // return IP (0x12, past the 2-byte INT) was pushed last, so it sits
        // at the lowest address / top of stack.
        assert_eq!(mem.peek16(0x2000, 0xfff8), 0x12);
        assert_eq!(mem.peek16(0x2000, 0xfffa), 0x1000); // saved CS
        assert_eq!(task.regs.esp.lo_word(), 0xfff8);
    }
}
