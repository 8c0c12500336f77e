//! SIGIO plumbing: the only channel between the keyboard's async byte
//! arrival and the supervisor's main loop.
//!
//! The handler itself must stay async-signal-safe: touch nothing but a
//! single flag. Communication is a single `AtomicBool`; races between a
//! second SIGIO arriving and the loop clearing the flag are harmless; a
//! queued byte is read on the next drain regardless.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::vm86::VmError;

static KEYBOARD_INPUT_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigio(_signum: i32) {
    KEYBOARD_INPUT_PENDING.store(true, Ordering::Relaxed);
}

/// Install the SIGIO handler. Call once during supervisor construction.
pub fn install() -> Result<(), VmError> {
    let action = SigAction::new(
        SigHandler::Handler(handle_sigio),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGIO, &action) }.map_err(VmError::Sigaction)?;
    Ok(())
}

/// Has a SIGIO arrived since the last [`clear`]?
pub fn keyboard_input_pending() -> bool {
    KEYBOARD_INPUT_PENDING.load(Ordering::Relaxed)
}

/// Clear the flag before draining stdin, so a SIGIO racing the drain is
/// observed on the *next* iteration rather than lost.
pub fn clear() {
    KEYBOARD_INPUT_PENDING.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_set_and_cleared() {
        clear();
        assert!(!keyboard_input_pending());
        handle_sigio(0);
        assert!(keyboard_input_pending());
        clear();
        assert!(!keyboard_input_pending());
    }
}
