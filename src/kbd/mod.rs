//! The KBDTABLES codec: [`Layout`](crate::layout::Layout) to and from the
//! table structures the Windows kernel keyboard subsystem consults.
//!
//! The tables are built as linker blobs so that pointers between them
//! resolve during section layout; see `kbd::keymap`, `kbd::charmap` and
//! `kbd::tables` for the individual structures.

pub mod charmap;
pub mod keymap;
pub mod tables;

/// VK_SHIFT.
pub const VK_SHIFT: u8 = 0x10;
/// VK_CONTROL.
pub const VK_CONTROL: u8 = 0x11;
/// VK_MENU (Alt).
pub const VK_MENU: u8 = 0x12;
/// VK_KANA.
pub const VK_KANA: u8 = 0x15;
/// The "no key" virtual key filling vacant VSC→VK slots.
pub const VK_NONE: u16 = 0xFF;

/// KBDEXT: the key is an extended (0xE0-prefixed) key.
pub const KBDEXT: u16 = 0x100;
/// KBDMULTIVK: the key produces different VKs depending on modifiers.
pub const KBDMULTIVK: u16 = 0x200;
/// KBDSPECIAL: the key needs special processing.
pub const KBDSPECIAL: u16 = 0x400;
/// KBDNUMPAD: the key is a numpad key.
pub const KBDNUMPAD: u16 = 0x800;

/// WCH_NONE: no character for this shift state.
pub const WCH_NONE: u16 = 0xF000;
/// WCH_DEAD: the character is a dead key; the continuation row carries it.
pub const WCH_DEAD: u16 = 0xF001;
/// WCH_LGTR: the character is a ligature (not supported, decode-only).
pub const WCH_LGTR: u16 = 0xF002;

/// Column value in `ModNumber` for a modifier mask no character uses.
pub const SHIFT_INVALID: u8 = 0x0F;

/// The composite virtual keys with a known plain 8-bit form, as
/// (composite, plain) pairs: VK_DIVIDE and VK_CANCEL drop KBDEXT,
/// VK_MULTIPLY drops KBDSPECIAL, and the numpad digits and decimal point
/// map to their KBDNUMPAD | KBDSPECIAL navigation counterparts.
pub const VK_TRANSLATION: &[(u16, u16)] = &[
    (0x16F, 0x6F),
    (0x103, 0x03),
    (0x26A, 0x6A),
    (0xC24, 0x67),
    (0xC26, 0x68),
    (0xC21, 0x69),
    (0xC25, 0x64),
    (0xC0C, 0x65),
    (0xC27, 0x66),
    (0xC23, 0x61),
    (0xC28, 0x62),
    (0xC22, 0x63),
    (0xC2D, 0x60),
    (0xC2E, 0x6E),
];

/// Maps a composite virtual key to its plain 8-bit form; keys without a
/// translation are returned unchanged.
pub fn translate_vk(vk: u16) -> u16 {
    VK_TRANSLATION
        .iter()
        .find(|&&(composite, _)| composite == vk)
        .map_or(vk, |&(_, plain)| plain)
}

/// Restores the composite form of a plain virtual key, if it has one.
pub fn untranslate_vk(vk: u16) -> u16 {
    VK_TRANSLATION
        .iter()
        .find(|&&(_, plain)| plain == vk)
        .map_or(vk, |&(composite, _)| composite)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_is_a_bijection() {
        for &(composite, plain) in VK_TRANSLATION {
            assert_eq!(translate_vk(composite), plain);
            assert_eq!(untranslate_vk(plain), composite);
        }
    }

    #[test]
    fn unknown_vks_pass_through() {
        assert_eq!(translate_vk(0x41), 0x41);
        assert_eq!(untranslate_vk(0x41), 0x41);
        assert_eq!(translate_vk(0x3FF), 0x3FF);
    }
}
