//! Raw Linux `vm86()` syscall ABI.
//!
//! The kernel's virtual-8086 facility is exposed through a single syscall,
//! `SYS_vm86` (`VM86_ENTER`), that takes a `struct vm86plus_struct` and either
//! runs the guest or returns a reason code explaining why it couldn't. None
//! of this is bound by the `libc` crate (it's an i386-only legacy facility),
//! so the struct layouts and constants here are transcribed from
//! `arch/x86/include/uapi/asm/vm86.h` the same way `kvm-bindings` transcribes
//! the ioctl structs `libc` doesn't carry.
//!
//! This module only builds on `target_arch = "x86"`: the VM86 facility does
//! not exist in long mode, so there is no 64-bit equivalent to bind.

/// CPU type to declare for the guest. 80286 - lets the kernel trap every
/// `IN`/`OUT` back to us instead of honoring a 386-style IOPL.
///
/// See [`crate::vm86::GUEST_CPU_TYPE`] for where this is actually used;
/// kept alongside the other `cpu_type` values here for completeness.
#[allow(dead_code)]
pub const CPU_086: u32 = 0;
#[allow(dead_code)]
pub const CPU_186: u32 = 1;
pub const CPU_286: u32 = 2;
#[allow(dead_code)]
pub const CPU_386: u32 = 3;
#[allow(dead_code)]
pub const CPU_486PLUS: u32 = 4;

/// `VM86_TYPE(retval)` / `VM86_ARG(retval)` from `asm/vm86.h`.
#[inline]
pub fn vm86_type(retval: i32) -> i32 {
    retval & 0xff
}

#[inline]
pub fn vm86_arg(retval: i32) -> i32 {
    retval >> 8
}

/// vm86 return reasons (`VM86_TYPE(retval)`).
pub const VM86_SIGNAL: i32 = 0;
pub const VM86_UNKNOWN: i32 = 1;
pub const VM86_INTX: i32 = 2;
pub const VM86_STI: i32 = 3;
pub const VM86_PICRETURN: i32 = 4;
pub const VM86_TRAP: i32 = 6;

/// `vm86()` subfunctions, passed as the first syscall argument.
/// Only read by the `target_arch = "x86"` arm of `vm86_enter` below.
#[allow(dead_code)]
pub const VM86_ENTER: u32 = 0;
#[allow(dead_code)]
pub const VM86_ENTER_NO_BYPASS: u32 = 1;
#[allow(dead_code)]
pub const VM86_REQUEST_IRQ: u32 = 2;
#[allow(dead_code)]
pub const VM86_FREE_IRQ: u32 = 3;
#[allow(dead_code)]
pub const VM86_GET_IRQ_BITS: u32 = 4;
#[allow(dead_code)]
pub const VM86_GET_AND_RESET_IRQ: u32 = 5;

/// EFLAGS bits the supervisor cares about.
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_VM: u32 = 1 << 17;
/// NT (bit 14) and IOPL (bits 12-13) plus one reserved bit - the clamp
/// described in SPEC_FULL.md "EFLAGS NT/IOPL clamp".
pub const FLAGS_NT_IOPL_MASK: u32 = 0xf << 12;

/// Mirrors `struct vm86_regs` exactly: plain 32-bit fields for the GPRs and
/// EIP/EFLAGS/ESP, paired `(selector, padding)` u16s for the segments. The
/// padding halves exist only so the struct's layout matches the kernel's;
/// nothing reads them.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Vm86Regs {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub __null_ds: u32,
    pub __null_es: u32,
    pub __null_fs: u32,
    pub __null_gs: u32,
    pub orig_eax: u32,
    pub eip: u32,
    pub cs: u16,
    pub __csh: u16,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u16,
    pub __ssh: u16,
    pub es: u16,
    pub __esh: u16,
    pub ds: u16,
    pub __dsh: u16,
    pub fs: u16,
    pub __fsh: u16,
    pub gs: u16,
    pub __gsh: u16,
}

/// 256-bit "which interrupts does the guest want delivered natively"
/// bitmap. We never mark anything revectored except via
/// `int_revectored` below, so this is always zeroed.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RevectoredStruct {
    pub map: [u32; 8],
}

impl RevectoredStruct {
    /// Mark `vector` as "always trap out to the supervisor", used to keep
    /// INT 0xE7 (DOSLINUX) from ever being serviced by the guest's own IVT.
    pub fn set(&mut self, vector: u8) {
        let word = (vector >> 5) as usize;
        let bit = vector & 0x1f;
        self.map[word] |= 1 << bit;
    }
}

/// `struct vm86plus_info_struct`: a bitfield word (force_return_for_pic,
/// vm86dbg_active, vm86dbg_TFpendig, 28 unused bits, is_vm86pus) followed by
/// the debug INTxx table. We only ever set `is_vm86pus`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Vm86PlusInfo {
    pub flags: u32,
    pub vm86dbg_intxxtab: [u8; 32],
}

const IS_VM86PUS_BIT: u32 = 1 << 31;

impl Vm86PlusInfo {
    pub fn with_is_vm86pus() -> Self {
        Self {
            flags: IS_VM86PUS_BIT,
            ..Default::default()
        }
    }
}

/// `struct vm86plus_struct`, the argument to `VM86_ENTER`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Vm86PlusStruct {
    pub regs: Vm86Regs,
    pub flags: u32,
    pub screen_bitmap: u32,
    pub cpu_type: u32,
    pub int_revectored: RevectoredStruct,
    pub int21_revectored: RevectoredStruct,
    pub vm86plus: Vm86PlusInfo,
}

#[cfg(target_arch = "x86")]
mod arch {
    use super::Vm86PlusStruct;
    use std::io;

    /// `syscall(SYS_vm86, VM86_ENTER, &mut vm86)`.
    ///
    /// Returns the raw return value on success (decode with
    /// [`super::vm86_type`]/[`super::vm86_arg`]), or the `errno` on failure.
    pub fn vm86_enter(vm86: &mut Vm86PlusStruct) -> io::Result<i32> {
        let rc = unsafe { libc::syscall(libc::SYS_vm86, super::VM86_ENTER, vm86 as *mut _) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as i32)
        }
    }

    /// `iopl(2)` - not bound by the `libc` crate, but exported by glibc on
    /// x86. Raising IOPL to 3 lets the supervisor issue `IN`/`OUT`
    /// directly; lowering it to 0 is what makes the guest's own `IN`/`OUT`
    /// trap back to us as a GPF.
    extern "C" {
        fn iopl(level: libc::c_int) -> libc::c_int;
    }

    pub fn set_iopl(level: i32) -> io::Result<()> {
        let rc = unsafe { iopl(level) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(not(target_arch = "x86"))]
mod arch {
    use super::Vm86PlusStruct;
    use std::io;

    pub fn vm86_enter(_vm86: &mut Vm86PlusStruct) -> io::Result<i32> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "vm86() is only available on target_arch = \"x86\"",
        ))
    }

    pub fn set_iopl(_level: i32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "iopl() is only available on target_arch = \"x86\"",
        ))
    }
}

pub use arch::{set_iopl, vm86_enter};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revectored_set_bit() {
        let mut r = RevectoredStruct::default();
        r.set(0xe7);
        // 0xe7 = 231 = word 7, bit 7
        assert_eq!(r.map[7], 1 << 7);
        for (i, word) in r.map.iter().enumerate() {
            if i != 7 {
                assert_eq!(*word, 0);
            }
        }
    }

    #[test]
    fn vm86plus_info_sets_top_bit_only() {
        let info = Vm86PlusInfo::with_is_vm86pus();
        assert_eq!(info.flags, 1 << 31);
    }

    #[test]
    fn vm86_type_and_arg_split_retval() {
        let retval = (0x10 << 8) | VM86_INTX;
        assert_eq!(vm86_type(retval), VM86_INTX);
        assert_eq!(vm86_arg(retval), 0x10);
    }

    #[test]
    fn vm86_regs_has_expected_size() {
        // 12 dwords + eip + cs/csh + eflags + esp + 5 more 16-bit pairs
        assert_eq!(std::mem::size_of::<Vm86Regs>(), 4 * 12 + 4 + 4 + 4 + 4 + 4 * 5);
    }
}
