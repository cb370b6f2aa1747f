/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
use bitflags::bitflags;

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

/// The number of key cells of the matrix.
pub const NUM_CELLS: usize = 64;
/// The cell index of the SHIFT key.
pub const SHIFT_CELL: u8 = 63;

bitflags! {
    /// Microbee keys as a set of key cells. The bit number of each key is its cell index.
    ///
    /// ```text
    ///  cells  +0  +1  +2  +3  +4  +5  +6  +7
    ///     0    @   A   B   C   D   E   F   G
    ///     8    H   I   J   K   L   M   N   O
    ///    16    P   Q   R   S   T   U   V   W
    ///    24    X   Y   Z   [   \   ]   ^  DEL
    ///    32    0   1   2   3   4   5   6   7
    ///    40    8   9   :   ;   ,   -   .   /
    ///    48  ESC  BS TAB  LF  CR LCK BRK SPC
    ///    56   UP CTL  DN  LT  F1  F2  RT SHFT
    /// ```
    #[derive(Default)]
    pub struct MbKeyboardMap: u64 {
        const AT        = 0x0000000000000001;
        const A         = 0x0000000000000002;
        const B         = 0x0000000000000004;
        const C         = 0x0000000000000008;
        const D         = 0x0000000000000010;
        const E         = 0x0000000000000020;
        const F         = 0x0000000000000040;
        const G         = 0x0000000000000080;
        const H         = 0x0000000000000100;
        const I         = 0x0000000000000200;
        const J         = 0x0000000000000400;
        const K         = 0x0000000000000800;
        const L         = 0x0000000000001000;
        const M         = 0x0000000000002000;
        const N         = 0x0000000000004000;
        const O         = 0x0000000000008000;
        const P         = 0x0000000000010000;
        const Q         = 0x0000000000020000;
        const R         = 0x0000000000040000;
        const S         = 0x0000000000080000;
        const T         = 0x0000000000100000;
        const U         = 0x0000000000200000;
        const V         = 0x0000000000400000;
        const W         = 0x0000000000800000;
        const X         = 0x0000000001000000;
        const Y         = 0x0000000002000000;
        const Z         = 0x0000000004000000;
        const LBRACKET  = 0x0000000008000000;
        const BACKSLASH = 0x0000000010000000;
        const RBRACKET  = 0x0000000020000000;
        const CARET     = 0x0000000040000000;
        const DEL       = 0x0000000080000000;
        const N0        = 0x0000000100000000;
        const N1        = 0x0000000200000000;
        const N2        = 0x0000000400000000;
        const N3        = 0x0000000800000000;
        const N4        = 0x0000001000000000;
        const N5        = 0x0000002000000000;
        const N6        = 0x0000004000000000;
        const N7        = 0x0000008000000000;
        const N8        = 0x0000010000000000;
        const N9        = 0x0000020000000000;
        const COLON     = 0x0000040000000000;
        const SEMICOLON = 0x0000080000000000;
        const COMMA     = 0x0000100000000000;
        const MINUS     = 0x0000200000000000;
        const PERIOD    = 0x0000400000000000;
        const SLASH     = 0x0000800000000000;
        const ESC       = 0x0001000000000000;
        const BS        = 0x0002000000000000;
        const TAB       = 0x0004000000000000;
        const LF        = 0x0008000000000000;
        const CR        = 0x0010000000000000;
        const LOCK      = 0x0020000000000000;
        const BREAK     = 0x0040000000000000;
        const SPACE     = 0x0080000000000000;
        const UP        = 0x0100000000000000;
        const CTRL      = 0x0200000000000000;
        const DOWN      = 0x0400000000000000;
        const LEFT      = 0x0800000000000000;
        const F1        = 0x1000000000000000;
        const F2        = 0x2000000000000000;
        const RIGHT     = 0x4000000000000000;
        const SHIFT     = 0x8000000000000000;
    }
}

impl MbKeyboardMap {
    /// Returns the map with a single key at the given `cell` (modulo 64).
    #[inline]
    pub fn from_cell(cell: u8) -> Self {
        MbKeyboardMap::from_bits_truncate(1 << (cell & 0x3F))
    }
    /// Returns the cell index if the map contains exactly one key.
    #[inline]
    pub fn cell(self) -> Option<u8> {
        if self.bits().count_ones() == 1 {
            Some(self.bits().trailing_zeros() as u8)
        }
        else {
            None
        }
    }
    /// Returns an iterator of the cell indexes of all keys in the map.
    pub fn cells(self) -> impl Iterator<Item=u8> {
        let bits = self.bits();
        (0..NUM_CELLS as u8).filter(move |n| bits & (1 << n) != 0)
    }
}

/// Host keys whose Microbee counterpart depends on the host SHIFT state.
///
/// The host keyboard layout places some characters on different keys than the Microbee.
/// E.g. the host `SHIFT`+`2` yields `@` which is an unshifted key of its own on the Microbee.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AmbiguousKey {
    /// `0` and `)`
    N0,
    /// `2` and `@`
    N2,
    /// `6` and `^`
    N6,
    /// `7` and `&`
    N7,
    /// `8` and `*`
    N8,
    /// `9` and `(`
    N9,
    /// `` ` `` and `~`
    Grave,
    /// `'` and `"`
    Quote,
    /// `;` and `:`
    Semicolon,
    /// `=` and `+`
    Equals,
    /// `-` and `_`
    Minus,
}

impl AmbiguousKey {
    /// All ambiguous keys.
    pub const ALL: [AmbiguousKey; 11] = [
        AmbiguousKey::N0, AmbiguousKey::N2, AmbiguousKey::N6, AmbiguousKey::N7, AmbiguousKey::N8,
        AmbiguousKey::N9, AmbiguousKey::Grave, AmbiguousKey::Quote, AmbiguousKey::Semicolon,
        AmbiguousKey::Equals, AmbiguousKey::Minus
    ];
    /// Returns the Microbee key and the Microbee SHIFT state producing the same character as this key
    /// with the host SHIFT state `shifted`.
    pub fn mapping(self, shifted: bool) -> (MbKeyboardMap, bool) {
        use AmbiguousKey::*;
        type Mb = MbKeyboardMap;
        match (self, shifted) {
            (N0, false) => (Mb::N0, false),
            (N0, true) => (Mb::N9, true),
            (N2, false) => (Mb::N2, false),
            (N2, true) => (Mb::AT, false),
            (N6, false) => (Mb::N6, false),
            (N6, true) => (Mb::CARET, false),
            (N7, false) => (Mb::N7, false),
            (N7, true) => (Mb::N6, true),
            (N8, false) => (Mb::N8, false),
            (N8, true) => (Mb::COLON, true),
            (N9, false) => (Mb::N9, false),
            (N9, true) => (Mb::N8, true),
            (Grave, false) => (Mb::AT, true),
            (Grave, true) => (Mb::CARET, true),
            (Quote, false) => (Mb::N7, true),
            (Quote, true) => (Mb::N2, true),
            (Semicolon, false) => (Mb::SEMICOLON, false),
            (Semicolon, true) => (Mb::COLON, false),
            (Equals, false) => (Mb::MINUS, true),
            (Equals, true) => (Mb::SEMICOLON, true),
            (Minus, false) => (Mb::MINUS, false),
            (Minus, true) => (Mb::DEL, false),
        }
    }
    /// Returns the index of this key in [AmbiguousKey::ALL].
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A host key event source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKey {
    /// Keys mapped directly to the Microbee keys regardless of the host SHIFT state.
    Key(MbKeyboardMap),
    /// The host SHIFT key.
    Shift,
    /// A key that needs the SHIFT state to be inverted, see [AmbiguousKey].
    Ambiguous(AmbiguousKey),
}

impl From<MbKeyboardMap> for HostKey {
    fn from(keys: MbKeyboardMap) -> Self {
        HostKey::Key(keys)
    }
}

impl From<AmbiguousKey> for HostKey {
    fn from(key: AmbiguousKey) -> Self {
        HostKey::Ambiguous(key)
    }
}

/// Returns the Microbee key and the SHIFT state producing the given ASCII character.
///
/// Returns `None` for characters that can't be typed on the Microbee keyboard.
pub fn key_for_char(ch: u8) -> Option<(MbKeyboardMap, bool)> {
    type Mb = MbKeyboardMap;
    Some(match ch {
        b'a'..=b'z' => (Mb::from_cell(ch - b'a' + 1), false),
        b'A'..=b'Z' => (Mb::from_cell(ch - b'A' + 1), true),
        b'0'..=b'9' => (Mb::from_cell(ch - b'0' + 32), false),
        b'!'..=b')' => (Mb::from_cell(ch - b'!' + 33), true),
        b'@' => (Mb::AT, false),
        b'`' => (Mb::AT, true),
        b'[' => (Mb::LBRACKET, false),
        b'{' => (Mb::LBRACKET, true),
        b'\\' => (Mb::BACKSLASH, false),
        b'|' => (Mb::BACKSLASH, true),
        b']' => (Mb::RBRACKET, false),
        b'}' => (Mb::RBRACKET, true),
        b'^' => (Mb::CARET, false),
        b'~' => (Mb::CARET, true),
        b'_' => (Mb::DEL, false),
        0x7F => (Mb::DEL, true),
        b':' => (Mb::COLON, false),
        b'*' => (Mb::COLON, true),
        b';' => (Mb::SEMICOLON, false),
        b'+' => (Mb::SEMICOLON, true),
        b',' => (Mb::COMMA, false),
        b'<' => (Mb::COMMA, true),
        b'-' => (Mb::MINUS, false),
        b'=' => (Mb::MINUS, true),
        b'.' => (Mb::PERIOD, false),
        b'>' => (Mb::PERIOD, true),
        b'/' => (Mb::SLASH, false),
        b'?' => (Mb::SLASH, true),
        b' ' => (Mb::SPACE, false),
        b'\n'|b'\r' => (Mb::CR, false),
        b'\t' => (Mb::TAB, false),
        0x1B => (Mb::ESC, false),
        0x08 => (Mb::BS, false),
        _ => return None
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_map_works() {
        assert_eq!(MbKeyboardMap::A, MbKeyboardMap::from_cell(1));
        assert_eq!(MbKeyboardMap::SHIFT, MbKeyboardMap::from_cell(SHIFT_CELL));
        assert_eq!(Some(SHIFT_CELL), MbKeyboardMap::SHIFT.cell());
        assert_eq!(Some(32), MbKeyboardMap::N0.cell());
        assert_eq!(Some(52), MbKeyboardMap::CR.cell());
        assert_eq!(None, (MbKeyboardMap::A|MbKeyboardMap::B).cell());
        assert_eq!(None, MbKeyboardMap::empty().cell());
        assert_eq!(vec![1, 2, 63], (MbKeyboardMap::A|MbKeyboardMap::B|MbKeyboardMap::SHIFT).cells().collect::<Vec<_>>());
        assert_eq!(64, MbKeyboardMap::all().cells().count());
    }

    #[test]
    fn ambiguous_keys_work() {
        for (index, &key) in AmbiguousKey::ALL.iter().enumerate() {
            assert_eq!(index, key.index());
            for &shifted in &[false, true] {
                let (cell, shift) = key.mapping(shifted);
                assert!(cell.cell().is_some());
                assert_ne!(MbKeyboardMap::SHIFT, cell);
                // the same character typed from a file gives the same key
                let ch = match (key, shifted) {
                    (AmbiguousKey::N0, false) => b'0',
                    (AmbiguousKey::N0, true) => b')',
                    (AmbiguousKey::N2, false) => b'2',
                    (AmbiguousKey::N2, true) => b'@',
                    (AmbiguousKey::N6, false) => b'6',
                    (AmbiguousKey::N6, true) => b'^',
                    (AmbiguousKey::N7, false) => b'7',
                    (AmbiguousKey::N7, true) => b'&',
                    (AmbiguousKey::N8, false) => b'8',
                    (AmbiguousKey::N8, true) => b'*',
                    (AmbiguousKey::N9, false) => b'9',
                    (AmbiguousKey::N9, true) => b'(',
                    (AmbiguousKey::Grave, false) => b'`',
                    (AmbiguousKey::Grave, true) => b'~',
                    (AmbiguousKey::Quote, false) => b'\'',
                    (AmbiguousKey::Quote, true) => b'"',
                    (AmbiguousKey::Semicolon, false) => b';',
                    (AmbiguousKey::Semicolon, true) => b':',
                    (AmbiguousKey::Equals, false) => b'=',
                    (AmbiguousKey::Equals, true) => b'+',
                    (AmbiguousKey::Minus, false) => b'-',
                    (AmbiguousKey::Minus, true) => b'_',
                };
                assert_eq!(Some((cell, shift)), key_for_char(ch), "{:?} {}", key, shifted);
            }
        }
    }

    #[test]
    fn key_for_char_works() {
        assert_eq!(Some((MbKeyboardMap::A, false)), key_for_char(b'a'));
        assert_eq!(Some((MbKeyboardMap::Z, true)), key_for_char(b'Z'));
        assert_eq!(Some((MbKeyboardMap::N1, true)), key_for_char(b'!'));
        assert_eq!(Some((MbKeyboardMap::N9, true)), key_for_char(b')'));
        assert_eq!(Some((MbKeyboardMap::CR, false)), key_for_char(b'\n'));
        assert_eq!(Some((MbKeyboardMap::CR, false)), key_for_char(b'\r'));
        assert_eq!(Some((MbKeyboardMap::SLASH, true)), key_for_char(b'?'));
        assert_eq!(None, key_for_char(0));
        assert_eq!(None, key_for_char(0x80));
        let mut count = 0;
        for ch in 0..=255u8 {
            if let Some((key, _)) = key_for_char(ch) {
                assert!(key.cell().is_some());
                count += 1;
            }
        }
        assert_eq!(2 * 26 + 10 + 9 + 12 + 12 + 1 + 2 + 3, count);
    }
}
