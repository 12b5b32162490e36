//! The in-memory keyboard model.
//!
//! A [`Layout`] is the language-neutral description a keyboard compiler
//! consumes: which scancodes exist ([`keymap`](Layout::keymap)), which
//! characters each virtual key produces under each modifier combination
//! ([`charmap`](Layout::charmap)), and how dead keys compose
//! ([`deadkeys`](Layout::deadkeys)).
//!
//! Iteration order is part of the contract: `keymap` and `charmap` are
//! `BTreeMap`s and iterate in ascending key order, while `deadkeys` and the
//! nested character maps are [`IndexMap`]s and iterate in insertion order.
//! Two compiles of the same layout therefore lay out identical tables.

use std::collections::BTreeMap;

use indexmap::IndexMap;

use crate::error::{Error, Result};

/// A raw key identifier as sent by the keyboard hardware.
///
/// The `prefix` is `0x00` for ordinary keys, `0xE0` for extended keys and
/// `0xE1` for the Pause key. Ordering (and therefore `keymap` iteration)
/// is by `(prefix, code)`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
pub struct ScanCode {
    /// Scancode prefix byte: `0x00`, `0xE0` or `0xE1`.
    pub prefix: u8,
    /// Scancode value.
    pub code: u8,
}

impl ScanCode {
    /// An ordinary (prefix-less) scancode.
    pub fn new(code: u8) -> Self {
        ScanCode { prefix: 0, code }
    }

    /// An extended (`0xE0`-prefixed) scancode.
    pub fn ext0(code: u8) -> Self {
        ScanCode { prefix: 0xE0, code }
    }

    /// An `0xE1`-prefixed scancode (in practice only Pause, `E1-1D`).
    pub fn ext1(code: u8) -> Self {
        ScanCode { prefix: 0xE1, code }
    }
}

/// Per-key attribute bits, mirroring the CAPLOK family in `kbd.h`.
#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone, Default)]
pub struct KeyAttributes {
    /// CAPLOK: CapsLock acts like Shift for this key.
    pub capslock: bool,
    /// SGCAPS: the key has a separate CapsLock row of characters
    /// (the Swiss-German convention).
    pub capslock_secondary: bool,
    /// CAPLOKALTGR: CapsLock also applies in the AltGr layer.
    pub capslock_altgr: bool,
    /// KANALOK: KanaLock acts like the Kana modifier for this key.
    pub kanalock: bool,
}

/// CAPLOK attribute bit.
pub const CAPLOK: u8 = 0x01;
/// SGCAPS attribute bit.
pub const SGCAPS: u8 = 0x02;
/// CAPLOKALTGR attribute bit.
pub const CAPLOKALTGR: u8 = 0x04;
/// KANALOK attribute bit.
pub const KANALOK: u8 = 0x08;

impl KeyAttributes {
    /// Packs the attributes into the `Attributes` byte of a VK_TO_WCHARS row.
    pub fn to_bits(self) -> u8 {
        let mut bits = 0;
        if self.capslock {
            bits |= CAPLOK;
        }
        if self.capslock_secondary {
            bits |= SGCAPS;
        }
        if self.capslock_altgr {
            bits |= CAPLOKALTGR;
        }
        if self.kanalock {
            bits |= KANALOK;
        }
        bits
    }

    /// Unpacks an `Attributes` byte; unknown bits are ignored.
    pub fn from_bits(bits: u8) -> Self {
        KeyAttributes {
            capslock: bits & CAPLOK != 0,
            capslock_secondary: bits & SGCAPS != 0,
            capslock_altgr: bits & CAPLOKALTGR != 0,
            kanalock: bits & KANALOK != 0,
        }
    }
}

/// The assignment of a scancode: a Windows virtual key, an optional display
/// name and the per-key attributes.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct KeyCode {
    /// Windows virtual key, possibly carrying composite flag bits
    /// (KBDEXT and friends).
    pub win_vk: u16,
    /// Display name for the key, or `None` when the default rule
    /// (`chr(vk & 0xFF)`) applies.
    pub name: Option<String>,
    /// CAPLOK-family attributes.
    pub attributes: KeyAttributes,
}

impl KeyCode {
    /// A key with the default name and no attributes.
    pub fn new(win_vk: u16) -> Self {
        KeyCode {
            win_vk,
            name: None,
            attributes: KeyAttributes::default(),
        }
    }

    /// A key with an explicit display name.
    pub fn named(win_vk: u16, name: &str) -> Self {
        KeyCode {
            win_vk,
            name: Some(name.to_string()),
            attributes: KeyAttributes::default(),
        }
    }
}

/// A combination of modifier keys held during a keystroke.
///
/// `capslock` does not participate in the modifier bit mask; it is only
/// meaningful on the secondary row of an SGCAPS key.
#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone, Default)]
pub struct ShiftState {
    /// Shift held.
    pub shift: bool,
    /// Control held.
    pub control: bool,
    /// Alt held (with Control this is AltGr).
    pub alt: bool,
    /// Kana modifier active.
    pub kana: bool,
    /// CapsLock layer selector for SGCAPS keys; never part of the mask.
    pub capslock: bool,
}

impl ShiftState {
    /// The Shift-only state.
    pub fn shift() -> Self {
        ShiftState {
            shift: true,
            ..Default::default()
        }
    }

    /// The AltGr (Control+Alt) state.
    pub fn altgr() -> Self {
        ShiftState {
            control: true,
            alt: true,
            ..Default::default()
        }
    }

    /// Packs into the KBDSHIFT/KBDCTRL/KBDALT/kana mask. `capslock` is
    /// deliberately excluded.
    pub fn to_bits(self) -> u16 {
        let mut mask = 0;
        if self.shift {
            mask |= 1;
        }
        if self.control {
            mask |= 2;
        }
        if self.alt {
            mask |= 4;
        }
        if self.kana {
            mask |= 8;
        }
        mask
    }

    /// Unpacks a modifier mask. The result never has `capslock` set.
    pub fn from_bits(mask: u16) -> Self {
        ShiftState {
            shift: mask & 1 != 0,
            control: mask & 2 != 0,
            alt: mask & 4 != 0,
            kana: mask & 8 != 0,
            capslock: false,
        }
    }

    /// The same state with `capslock` cleared.
    pub fn base(self) -> Self {
        ShiftState {
            capslock: false,
            ..self
        }
    }

    /// The same state with `capslock` set.
    pub fn with_capslock(self) -> Self {
        ShiftState {
            capslock: true,
            ..self
        }
    }
}

/// A single produced character, possibly a dead key.
#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone)]
pub struct Character {
    /// The Unicode scalar produced. Must lie in the Basic Multilingual
    /// Plane to be representable as a single UTF-16 unit.
    pub ch: char,
    /// Whether this is a dead key (combines with the next character).
    pub dead: bool,
}

impl Character {
    /// A plain (non-dead) character.
    pub fn plain(ch: char) -> Self {
        Character { ch, dead: false }
    }

    /// A dead character.
    pub fn dead(ch: char) -> Self {
        Character { ch, dead: true }
    }
}

/// A dead key: its display name and its composition table.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DeadKey {
    /// Display name ("acute", "circumflex", ...).
    pub name: String,
    /// base character -> composed character.
    pub charmap: IndexMap<char, Character>,
}

/// A complete keyboard layout.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Layout {
    /// Human-readable layout name.
    pub name: String,
    /// Author, stored as CompanyName in the version resource.
    pub author: String,
    /// Copyright string.
    pub copyright: String,
    /// (major, minor) version.
    pub version: (u16, u16),
    /// Target file name, `[A-Za-z0-9_]{1,8}.dll`.
    pub dll_name: String,
    /// Scancode assignments.
    pub keymap: BTreeMap<ScanCode, KeyCode>,
    /// Virtual key -> (shift state -> character). Keys are plain 8-bit
    /// virtual keys after composite translation.
    pub charmap: BTreeMap<u16, IndexMap<ShiftState, Character>>,
    /// Dead character -> composition table, in source order.
    pub deadkeys: IndexMap<char, DeadKey>,
}

impl Layout {
    /// Checks the constraints a layout must satisfy before it can be
    /// compiled. Violations are [`Error::Input`].
    pub fn validate(&self) -> Result<()> {
        let stem = self
            .dll_name
            .strip_suffix(".dll")
            .ok_or_else(|| Error::Input(format!("dll_name {:?} must end in .dll", self.dll_name)))?;
        if stem.is_empty() || stem.len() > 8 {
            return Err(Error::Input(format!(
                "dll_name stem {:?} must be 1 to 8 characters",
                stem
            )));
        }
        if !stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Input(format!(
                "dll_name stem {:?} may only contain [A-Za-z0-9_]",
                stem
            )));
        }
        for scancode in self.keymap.keys() {
            if !matches!(scancode.prefix, 0x00 | 0xE0 | 0xE1) {
                return Err(Error::Input(format!(
                    "invalid scancode prefix {:#x}",
                    scancode.prefix
                )));
            }
        }
        Ok(())
    }
}
