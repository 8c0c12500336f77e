//! DOSLINUX syscall: INT 0xE7, the host-shell escape hatch DOS programs on
//! this platform use to run a command and return.
//!
//! AH=0x00 is a presence probe; AH=0x01 reads the PSP command tail at
//! CS:0080h and execs it through the host shell while the guest is frozen.

use std::ffi::CString;

use crate::lowmem::LowMemory;
use crate::terminal::Terminal;
use crate::vm86::regs::GuestRegisters;

const PSP_COMMAND_TAIL_OFFSET: u16 = 0x0080;

/// Dispatch one INT 0xE7 call, identified by `AH` in `regs`.
pub fn dispatch(mem: &LowMemory, regs: &mut GuestRegisters, terminal: &Terminal) {
    match regs.eax.hi_byte() {
        0x00 => presence_probe(regs),
        0x01 => run_command(mem, regs, terminal),
        _ => {} // reserved, no-op
    }
}

fn presence_probe(regs: &mut GuestRegisters) {
    regs.eax.set_dword(0x0001);
}

/// Read the PSP command tail (length byte, then that many bytes - the
/// length byte is authoritative here; see DESIGN.md on the `\r`-terminator
/// question) and fork+exec the host shell against it.
fn run_command(mem: &LowMemory, regs: &GuestRegisters, terminal: &Terminal) {
    let cs = regs.cs;
    let len = mem.peek8(cs, PSP_COMMAND_TAIL_OFFSET) as usize;
    let mut command = Vec::with_capacity(len);
    for i in 0..len {
        command.push(mem.peek8(cs, PSP_COMMAND_TAIL_OFFSET + 1 + i as u16));
    }

    let command = match CString::new(command) {
        Ok(c) => c,
        Err(_) => {
            eprintln!("[DOSLINUX] command tail contains an embedded NUL, refusing to run");
            return;
        }
    };

    if let Err(e) = terminal.enter_cooked() {
        eprintln!("[DOSLINUX] failed to switch to cooked mode: {e}");
        return;
    }

    spawn_and_wait(&command);

    if let Err(e) = terminal.enter_raw() {
        eprintln!("[DOSLINUX] failed to switch back to raw mode: {e}");
    }
}

fn spawn_and_wait(command: &CString) {
    use nix::sys::wait::waitpid;
    use nix::unistd::{execvp, fork, ForkResult};

    // SAFETY: single-threaded at this point in the run loop; no locks held
    // across the fork that the child would need to avoid.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            if let Err(e) = waitpid(child, None) {
                eprintln!("[DOSLINUX] waitpid failed: {e}");
            }
        }
        Ok(ForkResult::Child) => {
            let sh = CString::new("/bin/sh").unwrap();
            let dash_c = CString::new("-c").unwrap();
            let _ = execvp(&sh, &[sh.clone(), dash_c, command.clone()]);
            std::process::exit(127);
        }
        Err(e) => eprintln!("[DOSLINUX] fork failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_probe_sets_ax_to_one() {
        let mut regs = GuestRegisters::default();
        regs.eax.set_hi_byte(0x00);

        presence_probe(&mut regs);

        assert_eq!(regs.eax.dword(), 0x0001);
    }
}
