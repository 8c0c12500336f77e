//! Two-mode host-terminal driver: raw (scancodes, non-blocking, signal-
//! driven) and cooked (line-edited, blocking). Grounded directly on the
//! collaborator's `term_init`/`term_raw_mode`/`term_normal_mode` sequence,
//! reimplemented against `nix`'s termios/ioctl bindings instead of calling
//! into libc by hand.

use std::io;
use std::os::unix::io::BorrowedFd;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::sys::termios::{self, SetArg, Termios};

use crate::vm86::VmError;

// linux/kd.h
const KDSKBMODE: libc::c_ulong = 0x4b45;
const K_XLATE: libc::c_int = 0x01;
const K_RAW: libc::c_int = 0x00;

// asm-generic/fcntl.h - F_SETSIG isn't in `libc` for every target, so it's
// transcribed here the same way `kernel_abi` transcribes vm86.h.
const F_SETSIG: libc::c_int = 10;

/// `ioctl(STDIN_FILENO, KDSKBMODE, mode)` - not bound by `nix`'s ioctl
/// macros (those target device-specific request codes, not the console
/// driver's), so called directly through `libc`.
fn kdskbmode(mode: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(libc::STDIN_FILENO, KDSKBMODE, mode) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn stdin_raw_fd() -> std::os::unix::io::RawFd {
    libc::STDIN_FILENO
}

/// `fcntl(STDIN_FILENO, F_SETSIG/F_SETOWN, ...)` - not exposed by `nix`'s
/// `FcntlArg` (those two commands are Linux-specific async-I/O knobs), so
/// called directly through `libc`, same as `kdskbmode` above.
fn fcntl_raw(cmd: libc::c_int, arg: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::fcntl(libc::STDIN_FILENO, cmd, arg) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Owns the original termios so [`Terminal::cooked`] can restore it exactly.
pub struct Terminal {
    stdin: BorrowedFd<'static>,
    normal: Termios,
    raw: Termios,
}

impl Terminal {
    /// Snapshot stdin's current termios and derive the raw-mode variant.
    /// Must be called once, before the first mode switch.
    pub fn init() -> Result<Self, VmError> {
        let stdin = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
        let normal = termios::tcgetattr(stdin).map_err(VmError::Termios)?;

        let mut raw = normal.clone();
        use nix::sys::termios::{ControlFlags, InputFlags, LocalFlags, OutputFlags};
        raw.input_flags &= !(InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON);
        raw.output_flags &= !OutputFlags::OPOST;
        raw.local_flags &=
            !(LocalFlags::ECHO | LocalFlags::ECHONL | LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN);
        raw.control_flags &= !(ControlFlags::CSIZE | ControlFlags::PARENB);
        raw.control_flags |= ControlFlags::CS8;

        Ok(Self { stdin, normal, raw })
    }

    /// Switch stdin into raw scancode mode: `KDSKBMODE=K_RAW`, SIGIO-driven
    /// non-blocking reads, and the stripped-down termios from `init`.
    pub fn enter_raw(&self) -> Result<(), VmError> {
        kdskbmode(K_RAW).map_err(|e| VmError::Ioctl("KDSKBMODE(K_RAW)", e))?;

        fcntl_raw(F_SETSIG, libc::SIGIO).map_err(|e| VmError::Ioctl("F_SETSIG", e))?;
        fcntl_raw(libc::F_SETOWN, unsafe { libc::getpid() })
            .map_err(|e| VmError::Ioctl("F_SETOWN", e))?;
        fcntl(stdin_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK | OFlag::O_ASYNC))
            .map_err(VmError::Fcntl)?;

        termios::tcsetattr(self.stdin, SetArg::TCSAFLUSH, &self.raw).map_err(VmError::Termios)?;
        Ok(())
    }

    /// Switch stdin back to cooked, line-edited, blocking mode.
    pub fn enter_cooked(&self) -> Result<(), VmError> {
        kdskbmode(K_XLATE).map_err(|e| VmError::Ioctl("KDSKBMODE(K_XLATE)", e))?;

        fcntl(stdin_raw_fd(), FcntlArg::F_SETFL(OFlag::empty())).map_err(VmError::Fcntl)?;
        termios::tcsetattr(self.stdin, SetArg::TCSAFLUSH, &self.normal).map_err(VmError::Termios)?;
        Ok(())
    }
}

/// VGA hardware cursor (ports 0x3D4/0x3D5, index 0x0E/0x0F) reconciled to an
/// ANSI cursor-position escape.
pub fn cursor_escape(row_major_position: u16) -> String {
    let y = row_major_position / 80;
    let x = row_major_position % 80;
    format!("\x1b[{};{}H", y + 1, x + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_escape_converts_raw_position() {
        assert_eq!(cursor_escape(0), "\x1b[1;1H");
        assert_eq!(cursor_escape(81), "\x1b[2;2H");
    }
}
