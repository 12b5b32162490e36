//! Windows wire primitives: ASCII and UTF-16LE strings, WCHAR units,
//! MAKELONG, and checked narrowing.
//!
//! Everything the keyboard tables store as text is UTF-16LE and must fit
//! the Basic Multilingual Plane (one code unit per character); surrogate
//! pairs cannot be addressed by the dead-key and name tables.

use crate::error::{Error, Result};
use crate::linker::{Arena, BlobId};

/// Size of `wchar_t` in C (aka [`u16`] in Rust).
pub const SIZE_OF_WCHAR: usize = core::mem::size_of::<u16>();

/// Encodes one character as a single UTF-16 unit; non-BMP scalars fail.
pub fn wchar_unit(ch: char) -> Result<u16> {
    let value = ch as u32;
    if value > 0xFFFF {
        return Err(Error::Unicode(format!(
            "character {:?} is outside the Basic Multilingual Plane",
            ch
        )));
    }
    Ok(value as u16)
}

/// Decodes a single UTF-16 unit back into a character; surrogate halves
/// fail.
pub fn char_from_unit(unit: u16) -> Result<char> {
    char::from_u32(unit as u32).ok_or_else(|| {
        Error::Unicode(format!("unit {:#x} is an unpaired surrogate", unit))
    })
}

/// Encodes a string as UTF-16 units, one per character.
pub fn utf16_units(text: &str) -> Result<Vec<u16>> {
    text.chars().map(wchar_unit).collect()
}

/// Builds a null-terminated ASCII string blob (alignment 1).
pub fn astr(arena: &mut Arena, text: &str) -> Result<BlobId> {
    if !text.is_ascii() {
        return Err(Error::Unicode(format!("{:?} is not ASCII", text)));
    }
    let mut data = text.as_bytes().to_vec();
    data.push(0);
    arena.blob_with(&data, 1)
}

/// Builds a null-terminated UTF-16LE string blob (alignment 2).
pub fn wstr(arena: &mut Arena, text: &str) -> Result<BlobId> {
    let blob = arena.blob(2)?;
    for unit in utf16_units(text)? {
        arena.append_u16(blob, unit)?;
    }
    arena.append_u16(blob, 0)?;
    Ok(blob)
}

/// `MAKELONG`: low word in the low half.
pub fn makelong(low: u16, high: u16) -> u32 {
    (low as u32) | ((high as u32) << 16)
}

/// Splits a `MAKELONG` back into (low, high).
pub fn split_long(value: u32) -> (u16, u16) {
    (value as u16, (value >> 16) as u16)
}

/// Narrows a length to u8, failing with `Overflow` when it does not fit.
pub fn u8_len(value: usize) -> Result<u8> {
    u8::try_from(value).map_err(|_| Error::Overflow {
        value: value as u64,
        width: 1,
    })
}

/// Narrows a length to u16, failing with `Overflow` when it does not fit.
pub fn u16_len(value: usize) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::Overflow {
        value: value as u64,
        width: 2,
    })
}

/// Converts a UTF-16LE byte slice (without terminator) into a `String`,
/// replacing invalid sequences.
pub fn utf16_bytes_to_string(bytes: &[u8]) -> String {
    let units = bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .take_while(|&unit| unit != 0)
        .collect::<Vec<_>>();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wstr_appends_terminator() {
        let mut arena = Arena::new();
        let blob = wstr(&mut arena, "Ab").unwrap();
        assert_eq!(arena.data(blob), b"A\x00b\x00\x00\x00");
    }

    #[test]
    fn astr_rejects_non_ascii() {
        let mut arena = Arena::new();
        assert!(astr(&mut arena, "kbd\u{00E9}.dll").is_err());
        let blob = astr(&mut arena, "kbdtst.dll").unwrap();
        assert_eq!(arena.data(blob), b"kbdtst.dll\x00");
    }

    #[test]
    fn wchar_rejects_non_bmp() {
        assert!(wchar_unit('\u{1F600}').is_err());
        assert_eq!(wchar_unit('\u{00E1}').unwrap(), 0xE1);
    }

    #[test]
    fn makelong_round_trips() {
        let value = makelong(0x0061, 0x00B4);
        assert_eq!(value, 0x00B4_0061);
        assert_eq!(split_long(value), (0x0061, 0x00B4));
    }

    #[test]
    fn utf16_bytes_stop_at_terminator() {
        assert_eq!(utf16_bytes_to_string(b"H\x00i\x00\x00\x00j\x00"), "Hi");
    }
}
