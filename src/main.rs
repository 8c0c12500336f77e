//! vm86sup - a VM86 supervisor that boots an MS-DOS real-mode guest under
//! Linux's virtual-8086 facility.
//!
//! This binary requires Linux on an x86 target (the kernel's VM86 facility
//! does not exist on x86_64 or other architectures); see `kernel_abi` for
//! the arch gating.

mod dos_syscall;
mod kernel_abi;
mod keyboard;
mod lowmem;
mod portio;
mod signals;
mod terminal;
mod vm86;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "vm86sup")]
#[command(about = "VM86 supervisor for running an MS-DOS real-mode guest under Linux")]
struct Args {
    /// Character device to map as guest low memory (conventional + HMA)
    #[arg(long, default_value = "/dev/mem")]
    mem_device: PathBuf,

    /// Raise diagnostic density; repeatable
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: Args) -> Result<(), vm86::VmError> {
    eprintln!("[VM86] vm86sup starting...");
    eprintln!("[VM86] mem device: {}", args.mem_device.display());
    if args.verbose > 0 {
        eprintln!("[VM86] verbosity level: {}", args.verbose);
    }

    let mut supervisor = vm86::Supervisor::new(&args.mem_device)?;
    supervisor.run();
}
