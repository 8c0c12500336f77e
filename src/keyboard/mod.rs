//! BIOS keyboard front-end: PS/2 scancode producer and INT 16h consumer.
//!
//! The keyboard has two concurrent roles sharing one piece of state. Bytes
//! arrive from the host terminal (raw mode, one byte per keypress/release)
//! and are decoded into BIOS keycodes by [`Keyboard::feed_scancode`]; the
//! guest drains them through the INT 16h functions implemented by
//! [`Keyboard::dispatch_int16`]. Port 0x60/0x64 access (the 8042 controller
//! registers some guest code reads directly, bypassing BIOS) is serviced by
//! [`Keyboard::port_in`]/[`Keyboard::port_out`].

pub mod scancode;

use std::collections::VecDeque;

use crate::vm86::regs::GuestRegisters;

const QUEUE_CAPACITY: usize = 16;

// flags0: BDA kbd_flag0 bits.
const RSHIFT: u8 = 1 << 0;
const LSHIFT: u8 = 1 << 1;
const CTRLACTIVE: u8 = 1 << 2;
const ALTACTIVE: u8 = 1 << 3;
const SCROLLACTIVE: u8 = 1 << 4;
const NUMACTIVE: u8 = 1 << 5;
const CAPSACTIVE: u8 = 1 << 6;

// flags1: BDA kbd_flag1 bits - E0/E1 latch and left/right modifier split.
const LAST_E0: u8 = 1 << 0;
const LAST_E1: u8 = 1 << 1;
const LCTRL: u8 = 1 << 2;
const RCTRL: u8 = 1 << 3;
const LALT: u8 = 1 << 4;
const RALT: u8 = 1 << 5;

/// Soft-reset magic value written when Ctrl+Alt+Del is detected.
pub const SOFT_RESET_MAGIC: u16 = 0x1234;

/// Translate an extended (`0xE0`-prefixed) raw keycode to its legacy
/// (AH=0x00/0x01) form, per the BIOS compatibility rules.
pub fn translate_legacy(keycode: u16) -> u16 {
    let ah = (keycode >> 8) as u8;
    let al = keycode as u8;
    if ah == 0xe0 && (al == 0x0d || al == 0x0a) {
        return 0x1c00 | al as u16;
    }
    if ah == 0xe0 && al == 0x2f {
        return 0x352f;
    }
    if (al == 0xe0 || al == 0xf0) && ah != 0 {
        return (ah as u16) << 8;
    }
    keycode
}

/// Result of dispatching an INT 16h function: whether it completed
/// immediately or needs the caller to poll stdin and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Int16Outcome {
    Completed,
    WouldBlock,
}

pub struct Keyboard {
    queue: VecDeque<u16>,
    flags0: u8,
    flags1: u8,
    pub soft_reset_flag: u16,
    caps_down: bool,
    num_down: bool,
    scroll_down: bool,
}

impl Keyboard {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::with_capacity(QUEUE_CAPACITY),
            flags0: 0,
            flags1: 0,
            soft_reset_flag: 0,
            caps_down: false,
            num_down: false,
            scroll_down: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn peek(&self) -> Option<u16> {
        self.queue.front().copied()
    }

    pub fn dequeue(&mut self) -> Option<u16> {
        self.queue.pop_front()
    }

    /// Enqueue a keycode (used by the producer, and by INT 16h/AH=0x05).
    /// Returns `false` if the queue was already full - the caller drops it.
    pub fn enqueue(&mut self, keycode: u16) -> bool {
        if self.queue.len() >= QUEUE_CAPACITY {
            return false;
        }
        self.queue.push_back(keycode);
        true
    }

    /// Feed one raw PS/2 scancode byte from the host terminal.
    pub fn feed_scancode(&mut self, byte: u8) {
        if byte == 0xe0 {
            self.flags1 |= LAST_E0;
            return;
        }
        if byte == 0xe1 {
            self.flags1 |= LAST_E1;
            return;
        }

        let was_e0 = self.flags1 & LAST_E0 != 0;
        let was_e1 = self.flags1 & LAST_E1 != 0;

        let released = byte & 0x80 != 0;
        let code = byte & 0x7f;

        if was_e1 {
            if code == 0x1d {
                // First byte of the Pause make/break pair - keep the E1
                // latch alive so the terminating 0x45 below is still
                // recognized as part of this sequence, not a bare NumLock.
                return;
            }
            // code == 0x45: Pause sequence consumed as a unit.
            self.flags1 &= !LAST_E1;
            return;
        }
        self.flags1 &= !LAST_E0;

        match code {
            0x3a => {
                if !released {
                    if !self.caps_down {
                        self.flags0 ^= CAPSACTIVE;
                        self.caps_down = true;
                    }
                } else {
                    self.caps_down = false;
                }
                return;
            }
            0x2a | 0x36 => {
                if was_e0 {
                    return; // fake shifts generated by E0-prefixed keys
                }
                let bit = if code == 0x2a { LSHIFT } else { RSHIFT };
                if released {
                    self.flags0 &= !bit;
                } else {
                    self.flags0 |= bit;
                }
                return;
            }
            0x1d => {
                let bit = if was_e0 { RCTRL } else { LCTRL };
                if released {
                    self.flags1 &= !bit;
                } else {
                    self.flags1 |= bit;
                }
                self.sync_ctrlactive();
                return;
            }
            0x38 => {
                let bit = if was_e0 { RALT } else { LALT };
                if released {
                    self.flags1 &= !bit;
                } else {
                    self.flags1 |= bit;
                }
                self.sync_altactive();
                return;
            }
            0x45 => {
                if !released {
                    if !self.num_down {
                        self.flags0 ^= NUMACTIVE;
                        self.num_down = true;
                    }
                } else {
                    self.num_down = false;
                }
                return;
            }
            0x46 => {
                if was_e0 {
                    return; // Ctrl-Break
                }
                if !released {
                    if !self.scroll_down {
                        self.flags0 ^= SCROLLACTIVE;
                        self.scroll_down = true;
                    }
                } else {
                    self.scroll_down = false;
                }
                return;
            }
            0x37 if was_e0 => return, // PrintScreen
            0x54 => return,           // SysReq
            0x53 => {
                let ctrl = self.flags0 & CTRLACTIVE != 0;
                let alt = self.flags0 & ALTACTIVE != 0;
                if !released && ctrl && alt {
                    self.soft_reset_flag = SOFT_RESET_MAGIC;
                    return;
                }
            }
            _ => {}
        }

        if released {
            return;
        }

        let entry = scancode::lookup(code);
        let shift = self.flags0 & (LSHIFT | RSHIFT) != 0;
        let ctrl = self.flags0 & CTRLACTIVE != 0;
        let alt = self.flags0 & ALTACTIVE != 0;

        let effective_shift = if scancode::is_keypad_scancode(code) {
            shift ^ (self.flags0 & NUMACTIVE != 0)
        } else if scancode::is_letter_scancode(code) {
            shift ^ (self.flags0 & CAPSACTIVE != 0)
        } else {
            shift
        };

        let ascii = if alt && entry.alt != 0 {
            entry.alt
        } else if ctrl && entry.ctrl != 0 {
            entry.ctrl
        } else if effective_shift {
            entry.shift
        } else {
            entry.normal
        };

        let base_keycode = ((code as u16) << 8) | ascii as u16;

        let keycode = if was_e0 && code == 0x1c {
            0xe00d
        } else if was_e0 && code == 0x35 {
            0xe02f
        } else if was_e0 && scancode::is_keypad_scancode(code) {
            if alt {
                (code as u16 + 0x50) << 8
            } else if ctrl || shift {
                (base_keycode & 0xff00) | 0xe0
            } else {
                base_keycode
            }
        } else {
            base_keycode
        };

        if keycode != 0 {
            self.enqueue(keycode);
        }
    }

    fn sync_ctrlactive(&mut self) {
        if self.flags1 & (LCTRL | RCTRL) != 0 {
            self.flags0 |= CTRLACTIVE;
        } else {
            self.flags0 &= !CTRLACTIVE;
        }
    }

    fn sync_altactive(&mut self) {
        if self.flags1 & (LALT | RALT) != 0 {
            self.flags0 |= ALTACTIVE;
        } else {
            self.flags0 &= !ALTACTIVE;
        }
    }

    /// Dispatch one INT 16h function, identified by `AH` in `regs`.
    pub fn dispatch_int16(&mut self, regs: &mut GuestRegisters) -> Int16Outcome {
        match regs.eax.hi_byte() {
            0x00 => match self.dequeue() {
                Some(k) => {
                    regs.eax.set_lo_word(translate_legacy(k));
                    Int16Outcome::Completed
                }
                None => Int16Outcome::WouldBlock,
            },
            0x01 => {
                match self.peek() {
                    Some(k) => {
                        regs.eax.set_lo_word(translate_legacy(k));
                        regs.set_zf(false);
                    }
                    None => regs.set_zf(true),
                }
                Int16Outcome::Completed
            }
            0x02 => {
                regs.eax.set_lo_byte(self.flags0);
                Int16Outcome::Completed
            }
            0x05 => {
                let ok = self.enqueue(regs.ecx.lo_word());
                regs.eax.set_lo_byte(if ok { 0 } else { 1 });
                Int16Outcome::Completed
            }
            0x09 => {
                regs.eax.set_lo_byte(0x30);
                Int16Outcome::Completed
            }
            0x0a => {
                regs.eax.set_lo_byte(0);
                Int16Outcome::Completed
            }
            0x10 => match self.dequeue() {
                Some(k) => {
                    regs.eax.set_lo_word(k);
                    Int16Outcome::Completed
                }
                None => Int16Outcome::WouldBlock,
            },
            0x11 => {
                match self.peek() {
                    Some(k) => {
                        regs.eax.set_lo_word(k);
                        regs.set_zf(false);
                    }
                    None => regs.set_zf(true),
                }
                Int16Outcome::Completed
            }
            0x12 => {
                regs.eax.set_lo_byte(self.flags0);
                regs.eax.set_hi_byte(self.flags1 & (RCTRL | RALT));
                Int16Outcome::Completed
            }
            0x6f => {
                regs.eax.set_hi_byte(0x02);
                Int16Outcome::Completed
            }
            0x92 => {
                regs.eax.set_hi_byte(0x80);
                Int16Outcome::Completed
            }
            0xa2 => Int16Outcome::Completed,
            _ => Int16Outcome::Completed,
        }
    }

    /// Read the 8042 controller data (0x60) or status (0x64) port.
    pub fn port_in(&mut self, port: u16) -> u8 {
        match port {
            0x60 => self.dequeue().map(|k| k as u8).unwrap_or(0),
            0x64 => {
                let has_data = if self.queue.is_empty() { 0 } else { 0x01 };
                0x04 | has_data // bit2 "system" flag always set
            }
            _ => 0,
        }
    }

    /// Write to the 8042 controller. We only recognize the "enable first
    /// PS/2 port" command; anything else is a no-op for the caller to log.
    pub fn port_out(&mut self, _port: u16, _value: u8) {}
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_never_exceeds_capacity() {
        let mut kbd = Keyboard::new();
        for _ in 0..20 {
            kbd.enqueue(0x1e61);
        }
        assert_eq!(kbd.queue.len(), QUEUE_CAPACITY);
    }

    #[test]
    fn key_echo_lowercase_a() {
        let mut kbd = Keyboard::new();
        kbd.feed_scancode(0x1e); // press 'a'
        kbd.feed_scancode(0x9e); // release
        assert_eq!(kbd.dequeue(), Some(0x1e61));
        assert!(kbd.is_empty());
    }

    #[test]
    fn shifted_key_produces_uppercase() {
        let mut kbd = Keyboard::new();
        kbd.feed_scancode(0x2a); // LShift down
        kbd.feed_scancode(0x1e); // 'a'
        kbd.feed_scancode(0x9e); // release 'a'
        kbd.feed_scancode(0xaa); // LShift up
        assert_eq!(kbd.dequeue(), Some(0x1e41));
    }

    #[test]
    fn extended_enter_roundtrip() {
        let mut kbd = Keyboard::new();
        kbd.feed_scancode(0xe0);
        kbd.feed_scancode(0x1c);
        kbd.feed_scancode(0xe0);
        kbd.feed_scancode(0x9c);
        let raw = kbd.dequeue().unwrap();
        assert_eq!(raw, 0xe00d);
        assert_eq!(translate_legacy(raw), 0x1c0d);
    }

    #[test]
    fn e0_e1_latch_is_exclusive() {
        let mut kbd = Keyboard::new();
        kbd.feed_scancode(0xe0);
        assert_eq!(kbd.flags1 & (LAST_E0 | LAST_E1), LAST_E0);
        kbd.feed_scancode(0x1c);
        assert_eq!(kbd.flags1 & (LAST_E0 | LAST_E1), 0);
    }

    #[test]
    fn pause_key_does_not_toggle_numlock() {
        let mut kbd = Keyboard::new();
        let before = kbd.flags0 & NUMACTIVE;
        kbd.feed_scancode(0xe1);
        kbd.feed_scancode(0x1d);
        kbd.feed_scancode(0x45);
        assert_eq!(kbd.flags0 & NUMACTIVE, before);
        assert!(kbd.is_empty());
    }

    #[test]
    fn pause_break_sequence_also_consumed_as_a_unit() {
        let mut kbd = Keyboard::new();
        let before = kbd.flags0 & NUMACTIVE;
        kbd.feed_scancode(0xe1);
        kbd.feed_scancode(0x9d);
        kbd.feed_scancode(0xc5);
        assert_eq!(kbd.flags0 & NUMACTIVE, before);
        assert!(kbd.is_empty());
    }

    #[test]
    fn ctrl_alt_del_sets_soft_reset() {
        let mut kbd = Keyboard::new();
        kbd.feed_scancode(0x1d); // ctrl down
        kbd.feed_scancode(0x38); // alt down
        kbd.feed_scancode(0x53); // del press
        assert_eq!(kbd.soft_reset_flag, SOFT_RESET_MAGIC);
    }

    #[test]
    fn del_without_both_modifiers_does_not_reset() {
        let mut kbd = Keyboard::new();
        kbd.feed_scancode(0x1d); // ctrl down only
        kbd.feed_scancode(0x53); // del press
        assert_eq!(kbd.soft_reset_flag, 0);
    }

    #[test]
    fn int16_status_sets_zf_on_empty_queue() {
        let mut kbd = Keyboard::new();
        let mut regs = GuestRegisters::default();
        regs.eax.set_hi_byte(0x01);
        kbd.dispatch_int16(&mut regs);
        assert!(regs.zf());
    }

    #[test]
    fn int16_read_would_block_on_empty_queue() {
        let mut kbd = Keyboard::new();
        let mut regs = GuestRegisters::default();
        regs.eax.set_hi_byte(0x00);
        assert_eq!(kbd.dispatch_int16(&mut regs), Int16Outcome::WouldBlock);
    }

    #[test]
    fn int16_enqueue_reports_full_queue() {
        let mut kbd = Keyboard::new();
        for _ in 0..QUEUE_CAPACITY {
            kbd.enqueue(0x1e61);
        }
        let mut regs = GuestRegisters::default();
        regs.eax.set_hi_byte(0x05);
        regs.ecx.set_lo_word(0x1e61);
        kbd.dispatch_int16(&mut regs);
        assert_eq!(regs.eax.lo_byte(), 1);
    }
}
