//! The VM86 supervisor: owns the guest's register block, the shared
//! low-memory mapping, and the run loop that bounces between the kernel's
//! VM86 facility and this process.

pub mod emulator;
pub mod interrupts;
pub mod regs;

use std::path::Path;

use nix::libc;
use thiserror::Error;

use crate::dos_syscall;
use crate::kernel_abi::{
    self, RevectoredStruct, Vm86PlusInfo, Vm86PlusStruct, FLAG_VM, VM86_INTX, VM86_PICRETURN,
    VM86_SIGNAL, VM86_STI, VM86_TRAP, VM86_UNKNOWN,
};
use crate::keyboard::Int16Outcome;
use crate::lowmem::LowMemory;
use crate::portio::{HostIo, RawPorts};
use crate::signals;
use crate::terminal::{self, Terminal};
use regs::{GuestRegisters, Task};

/// CPU type declared to the kernel. See `kernel_abi::CPU_286` for why:
/// a 386 guest would let the kernel honor IOPL and bypass port-trapping.
pub const GUEST_CPU_TYPE: u32 = kernel_abi::CPU_286;

/// DOSLINUX syscall vector, always forced to trap out to the supervisor.
const DOSLINUX_VECTOR: u8 = 0xe7;

/// Hardware IRQ1 (keyboard), injected after draining stdin.
const IRQ1_VECTOR: u8 = 0x09;

#[derive(Error, Debug)]
pub enum VmError {
    #[error("failed to map low memory: {0}")]
    LowMemoryMap(#[source] std::io::Error),

    #[error("failed to read terminal attributes: {0}")]
    Termios(#[source] nix::Error),

    #[error("ioctl {0} failed: {1}")]
    Ioctl(&'static str, #[source] std::io::Error),

    #[error("fcntl failed: {0}")]
    Fcntl(#[source] nix::Error),

    #[error("failed to install signal handler: {0}")]
    Sigaction(#[source] nix::Error),

    /// Never constructed on this host (x86_64): `set_iopl` failures go
    /// straight to [`fatal`] instead, since there's no caller left to
    /// propagate a `Result` to. Kept for the `target_arch = "x86"` build.
    #[allow(dead_code)]
    #[error("failed to set IOPL: {0}")]
    SetIopl(#[source] std::io::Error),

    #[allow(dead_code)]
    #[error("vm86() syscall failed: {0}")]
    Vm86Enter(#[source] std::io::Error),
}

/// Log and keep running - the fatal-but-not-a-Result path for guest
/// programmer errors the kernel's VM86 re-entry boundary can't unwind
/// through. Matches the C prototype's `halt()`: never exits, since this
/// process may be running as PID 1.
pub fn fatal(msg: &str) -> ! {
    eprintln!("[VM86] fatal: {msg}");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}

/// Owns everything the run loop touches: guest state, shared memory, the
/// host terminal, and the raw-port I/O seam.
pub struct Supervisor<IO: HostIo> {
    mem: LowMemory,
    io: IO,
    terminal: Terminal,
    task: Task,
}

impl Supervisor<RawPorts> {
    /// Build the supervisor against real hardware: map `mem_device`,
    /// snapshot the terminal, install SIGIO, and seed registers from the
    /// `vm86_init` boot record.
    pub fn new(mem_device: &Path) -> Result<Self, VmError> {
        let mem = LowMemory::map(mem_device)?;
        let terminal = Terminal::init()?;
        signals::install()?;
        terminal.enter_raw()?;

        let init = mem.read_vm86_init();
        let regs = GuestRegisters::from_boot_record(&init);

        Ok(Self {
            mem,
            io: RawPorts,
            terminal,
            task: Task::new(regs),
        })
    }
}

impl<IO: HostIo> Supervisor<IO> {
    /// Run forever. Never returns - process exit is the only termination.
    pub fn run(&mut self) -> ! {
        loop {
            if let Err(e) = kernel_abi::set_iopl(0) {
                fatal(&format!("iopl(0) failed before vm86 entry: {e}"));
            }

            let mut plus = Vm86PlusStruct {
                cpu_type: GUEST_CPU_TYPE,
                vm86plus: Vm86PlusInfo::with_is_vm86pus(),
                ..Default::default()
            };
            let mut revectored = RevectoredStruct::default();
            revectored.set(DOSLINUX_VECTOR);
            plus.int_revectored = revectored;
            self.task.regs.load(&mut plus.regs);
            plus.regs.eflags |= FLAG_VM;

            let retval = match kernel_abi::vm86_enter(&mut plus) {
                Ok(rc) => rc,
                Err(e) => fatal(&format!("vm86() syscall failed: {e}")),
            };
            self.task.regs.store(&plus.regs);

            if let Err(e) = kernel_abi::set_iopl(3) {
                fatal(&format!("iopl(3) failed after vm86 entry: {e}"));
            }

            let position = self.io.inb_vga_cursor();
            print!("{}", terminal::cursor_escape(position));

            let reason = kernel_abi::vm86_type(retval);
            let arg = kernel_abi::vm86_arg(retval);
            self.dispatch(reason, arg as u8);
        }
    }

    fn dispatch(&mut self, reason: i32, arg: u8) {
        match reason {
            VM86_SIGNAL => self.handle_signal(),
            VM86_UNKNOWN => {
                match emulator::step(&self.mem, &mut self.io, &mut self.task) {
                    emulator::Step::Continue => {}
                    emulator::Step::Fatal(msg) => fatal(&msg),
                }
                self.task.regs.clamp_flags();
            }
            VM86_INTX => self.handle_intx(arg),
            VM86_STI => {
                interrupts::dispatch_pending(&self.mem, &mut self.task.regs, &mut self.task.pending);
            }
            VM86_TRAP => eprintln!("[VM86] trap, continuing"),
            VM86_PICRETURN => eprintln!("[VM86] PIC return, continuing"),
            other => eprintln!("[VM86] unknown return reason {other}"),
        }
    }

    fn handle_signal(&mut self) {
        if !signals::keyboard_input_pending() {
            return;
        }
        signals::clear();

        let mut saw_byte = false;
        loop {
            let mut byte = [0u8; 1];
            match nix::unistd::read(libc::STDIN_FILENO, &mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    saw_byte = true;
                    self.task.keyboard.feed_scancode(byte[0]);
                }
                Err(_) => break, // EAGAIN or otherwise: nothing more to drain
            }
        }

        if self.task.keyboard.soft_reset_flag != 0 {
            fatal("Ctrl+Alt+Del soft reset requested (reboot not implemented)");
        }

        if saw_byte {
            interrupts::vm86_interrupt(&self.mem, &mut self.task.regs, &mut self.task.pending, IRQ1_VECTOR);
        }
    }

    fn handle_intx(&mut self, vector: u8) {
        match vector {
            DOSLINUX_VECTOR => dos_syscall::dispatch(&self.mem, &mut self.task.regs, &self.terminal),
            0x16 => {
                if self.task.keyboard.dispatch_int16(&mut self.task.regs) == Int16Outcome::WouldBlock {
                    self.block_for_keycode();
                }
            }
            0x15 if self.task.regs.eax.hi_byte() == 0x4f => {
                interrupts::do_int(&self.mem, &mut self.task.regs, vector);
            }
            0x15 if self.task.regs.eax.dword() & 0xffff == 0x5305 => {
                // APM CPU idle: swallowed, guest proceeds as if serviced.
            }
            0x13 if self.task.regs.eax.hi_byte() == 0x02 => {
                interrupts::do_int(&self.mem, &mut self.task.regs, vector);
            }
            0x1a if self.task.regs.eax.hi_byte() <= 0x0f => {
                interrupts::do_int(&self.mem, &mut self.task.regs, vector);
            }
            other => {
                eprintln!("[VM86] unhandled INT {other:#04x}, AH={:#04x}", self.task.regs.eax.hi_byte());
                interrupts::do_int(&self.mem, &mut self.task.regs, other);
            }
        }
    }

    /// Block until at least one keycode is available, per the INT 16h/AH=00
    /// "poll stdin then retry" contract.
    fn block_for_keycode(&mut self) {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

        let stdin = unsafe { std::os::fd::BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
        while self.task.keyboard.is_empty() {
            let mut fds = [PollFd::new(stdin, PollFlags::POLLIN)];
            if poll(&mut fds, PollTimeout::NONE).is_err() {
                continue;
            }

            let mut byte = [0u8; 1];
            match nix::unistd::read(libc::STDIN_FILENO, &mut byte) {
                Ok(0) | Err(_) => continue,
                Ok(_) => self.task.keyboard.feed_scancode(byte[0]),
            }
        }
        self.task.keyboard.dispatch_int16(&mut self.task.regs);
    }
}

/// VGA hardware cursor read, split out so the run loop can stay generic
/// over [`HostIo`] in tests.
trait CursorRead {
    fn inb_vga_cursor(&mut self) -> u16;
}

impl<T: HostIo> CursorRead for T {
    fn inb_vga_cursor(&mut self) -> u16 {
        self.outb(0x3d4, 0x0e);
        let hi = self.inb(0x3d5) as u16;
        self.outb(0x3d4, 0x0f);
        let lo = self.inb(0x3d5) as u16;
        (hi << 8) | lo
    }
}
