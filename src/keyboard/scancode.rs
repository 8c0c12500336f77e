//! PS/2 Set-1 scancode to ASCII lookup.
//!
//! Covers the alphanumeric block, punctuation, and the numeric keypad. Each
//! entry gives the ASCII byte produced under the four modifier states the
//! BIOS distinguishes; `0` means "no ASCII, extended/control key" (the
//! caller still gets `AH = scancode`). Not exhaustive over the whole
//! keyboard (function keys, for instance, never carry an ASCII byte and so
//! need no table entry beyond their bare scancode).

/// ASCII byte produced by a scancode under each modifier state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanEntry {
    pub normal: u8,
    pub shift: u8,
    pub ctrl: u8,
    pub alt: u8,
}

impl ScanEntry {
    const fn letter(lower: u8, upper: u8, ctrl: u8) -> Self {
        Self {
            normal: lower,
            shift: upper,
            ctrl,
            alt: 0,
        }
    }

    const fn punct(normal: u8, shift: u8) -> Self {
        Self {
            normal,
            shift,
            ctrl: 0,
            alt: 0,
        }
    }

    const fn keypad(digit: u8) -> Self {
        // normal = 0 (extended/nav key, no ASCII); shift = digit, selected
        // when NumLock inverts the effective shift state.
        Self {
            normal: 0,
            shift: digit,
            ctrl: 0,
            alt: 0,
        }
    }

    const EMPTY: Self = Self {
        normal: 0,
        shift: 0,
        ctrl: 0,
        alt: 0,
    };
}

/// True for the scancodes CapsLock inverts the shift state of.
pub fn is_letter_scancode(scancode: u8) -> bool {
    matches!(
        scancode,
        0x10..=0x19 | 0x1e..=0x26 | 0x2c..=0x32
    )
}

/// True for the numeric-keypad block NumLock inverts the shift state of.
pub fn is_keypad_scancode(scancode: u8) -> bool {
    matches!(scancode, 0x47..=0x53)
}

/// Look up the ASCII table entry for `scancode` (make code, `0x80` bit
/// already stripped).
pub fn lookup(scancode: u8) -> ScanEntry {
    match scancode {
        0x01 => ScanEntry::punct(0x1b, 0x1b), // Esc
        0x02 => ScanEntry::punct(b'1', b'!'),
        0x03 => ScanEntry::punct(b'2', b'@'),
        0x04 => ScanEntry::punct(b'3', b'#'),
        0x05 => ScanEntry::punct(b'4', b'$'),
        0x06 => ScanEntry::punct(b'5', b'%'),
        0x07 => ScanEntry::punct(b'6', b'^'),
        0x08 => ScanEntry::punct(b'7', b'&'),
        0x09 => ScanEntry::punct(b'8', b'*'),
        0x0a => ScanEntry::punct(b'9', b'('),
        0x0b => ScanEntry::punct(b'0', b')'),
        0x0c => ScanEntry::punct(b'-', b'_'),
        0x0d => ScanEntry::punct(b'=', b'+'),
        0x0e => ScanEntry::punct(0x08, 0x08), // Backspace
        0x0f => ScanEntry::punct(0x09, 0x09), // Tab

        0x10 => ScanEntry::letter(b'q', b'Q', 0x11),
        0x11 => ScanEntry::letter(b'w', b'W', 0x17),
        0x12 => ScanEntry::letter(b'e', b'E', 0x05),
        0x13 => ScanEntry::letter(b'r', b'R', 0x12),
        0x14 => ScanEntry::letter(b't', b'T', 0x14),
        0x15 => ScanEntry::letter(b'y', b'Y', 0x19),
        0x16 => ScanEntry::letter(b'u', b'U', 0x15),
        0x17 => ScanEntry::letter(b'i', b'I', 0x09),
        0x18 => ScanEntry::letter(b'o', b'O', 0x0f),
        0x19 => ScanEntry::letter(b'p', b'P', 0x10),
        0x1a => ScanEntry::punct(b'[', b'{'),
        0x1b => ScanEntry::punct(b']', b'}'),
        0x1c => ScanEntry::punct(0x0d, 0x0d), // Enter

        0x1e => ScanEntry::letter(b'a', b'A', 0x01),
        0x1f => ScanEntry::letter(b's', b'S', 0x13),
        0x20 => ScanEntry::letter(b'd', b'D', 0x04),
        0x21 => ScanEntry::letter(b'f', b'F', 0x06),
        0x22 => ScanEntry::letter(b'g', b'G', 0x07),
        0x23 => ScanEntry::letter(b'h', b'H', 0x08),
        0x24 => ScanEntry::letter(b'j', b'J', 0x0a),
        0x25 => ScanEntry::letter(b'k', b'K', 0x0b),
        0x26 => ScanEntry::letter(b'l', b'L', 0x0c),
        0x27 => ScanEntry::punct(b';', b':'),
        0x28 => ScanEntry::punct(b'\'', b'"'),
        0x29 => ScanEntry::punct(b'`', b'~'),
        0x2b => ScanEntry::punct(b'\\', b'|'),

        0x2c => ScanEntry::letter(b'z', b'Z', 0x1a),
        0x2d => ScanEntry::letter(b'x', b'X', 0x18),
        0x2e => ScanEntry::letter(b'c', b'C', 0x03),
        0x2f => ScanEntry::letter(b'v', b'V', 0x16),
        0x30 => ScanEntry::letter(b'b', b'B', 0x02),
        0x31 => ScanEntry::letter(b'n', b'N', 0x0e),
        0x32 => ScanEntry::letter(b'm', b'M', 0x0d),
        0x33 => ScanEntry::punct(b',', b'<'),
        0x34 => ScanEntry::punct(b'.', b'>'),
        0x35 => ScanEntry::punct(b'/', b'?'),
        0x39 => ScanEntry::punct(b' ', b' '), // Space

        0x47 => ScanEntry::keypad(b'7'),
        0x48 => ScanEntry::keypad(b'8'),
        0x49 => ScanEntry::keypad(b'9'),
        0x4a => ScanEntry::punct(b'-', b'-'),
        0x4b => ScanEntry::keypad(b'4'),
        0x4c => ScanEntry::keypad(b'5'),
        0x4d => ScanEntry::keypad(b'6'),
        0x4e => ScanEntry::punct(b'+', b'+'),
        0x4f => ScanEntry::keypad(b'1'),
        0x50 => ScanEntry::keypad(b'2'),
        0x51 => ScanEntry::keypad(b'3'),
        0x52 => ScanEntry::keypad(b'0'),
        0x53 => ScanEntry::keypad(b'.'),

        _ => ScanEntry::EMPTY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letter_a_has_expected_columns() {
        let e = lookup(0x1e);
        assert_eq!(e.normal, b'a');
        assert_eq!(e.shift, b'A');
        assert_eq!(e.ctrl, 0x01);
    }

    #[test]
    fn digit_row_shift_gives_symbol() {
        let e = lookup(0x02);
        assert_eq!(e.normal, b'1');
        assert_eq!(e.shift, b'!');
    }

    #[test]
    fn keypad_seven_is_extended_unless_shifted() {
        let e = lookup(0x47);
        assert_eq!(e.normal, 0);
        assert_eq!(e.shift, b'7');
    }

    #[test]
    fn unmapped_scancode_is_empty() {
        assert_eq!(lookup(0x3b), ScanEntry::EMPTY); // F1: no ASCII
    }

    #[test]
    fn letter_and_keypad_classification() {
        assert!(is_letter_scancode(0x1e));
        assert!(!is_letter_scancode(0x02));
        assert!(is_keypad_scancode(0x47));
        assert!(!is_keypad_scancode(0x1e));
    }
}
