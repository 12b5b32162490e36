//! Scancode-to-virtual-key tables and key-name tables.
//!
//! Three VSC→VK tables (flat prefix-0, `0xE0` pairs, `0xE1` pairs) and two
//! name tables. Name routing is not the obvious one: the Pause key
//! (`E1-1D`) is named in the *base* table under VSC `0x45`, while NumLock
//! (plain `0x45`) and all `0xE0` keys are named in the *extended* table.
//! Only names that differ from the default (`chr(vk & 0xFF)`) are stored.

use std::collections::BTreeMap;

use log::debug;

use crate::arch::Arch;
use crate::error::{push_warning, Result, Warning};
use crate::kbd::VK_NONE;
use crate::layout::{KeyCode, Layout, ScanCode};
use crate::linker::{Arena, BlobId, BlobReader, Symbol};
use crate::pe::ImageView;
use crate::wintypes::wstr;

/// The keymap-derived table blobs.
#[derive(Debug, Copy, Clone)]
pub struct KeymapBlobs {
    /// Flat `u16` VSC→VK table for prefix-0 scancodes.
    pub vsc_to_vk: BlobId,
    /// Zero-terminated (vsc, vk) rows for `0xE0`-prefixed scancodes.
    pub vsc_to_vk_e0: BlobId,
    /// Zero-terminated (vsc, vk) rows for `0xE1`-prefixed scancodes.
    pub vsc_to_vk_e1: BlobId,
    /// Zero-terminated (vsc, name-pointer) rows, base keys.
    pub key_names: BlobId,
    /// Zero-terminated (vsc, name-pointer) rows, extended keys.
    pub key_names_ext: BlobId,
}

fn default_name(vk: u16) -> String {
    // always a valid scalar: vk & 0xFF is below 0x100
    char::from_u32((vk & 0xFF) as u32)
        .map(String::from)
        .unwrap_or_default()
}

fn explicit_name(key: &KeyCode) -> Option<&str> {
    match &key.name {
        Some(name) if *name != default_name(key.win_vk) => Some(name),
        _ => None,
    }
}

fn lptr(arch: Arch, target: Option<BlobId>) -> Symbol {
    Symbol::pointer(arch.long_pointer(), arch.image_base(), target)
}

/// Builds the VSC→VK and key-name tables from `layout.keymap`.
pub fn compile(arena: &mut Arena, layout: &Layout, arch: Arch) -> Result<KeymapBlobs> {
    let vsc_to_vk = arena.blob(4)?;
    let max_code = layout
        .keymap
        .keys()
        .filter(|scancode| scancode.prefix == 0)
        .map(|scancode| scancode.code)
        .max()
        .unwrap_or(0);
    for code in 0..=max_code {
        let vk = layout
            .keymap
            .get(&ScanCode::new(code))
            .map_or(VK_NONE, |key| key.win_vk);
        arena.append_u16(vsc_to_vk, vk)?;
    }

    let key_names = arena.blob(8)?;
    let key_names_ext = arena.blob(8)?;
    let vsc_to_vk_e0 = arena.blob(4)?;
    let vsc_to_vk_e1 = arena.blob(4)?;
    for (&scancode, key) in &layout.keymap {
        match scancode.prefix {
            0xE0 => {
                arena.append_u8(vsc_to_vk_e0, scancode.code)?;
                arena.append_u16(vsc_to_vk_e0, key.win_vk)?;
            }
            0xE1 => {
                arena.append_u8(vsc_to_vk_e1, scancode.code)?;
                arena.append_u16(vsc_to_vk_e1, key.win_vk)?;
            }
            _ => {}
        }
        if let Some(name) = explicit_name(key) {
            let name_blob = wstr(arena, name)?;
            let pointer = lptr(arch, Some(name_blob));
            if scancode == ScanCode::ext1(0x1D) {
                // Pause lives in the base table under NumLock's scancode
                arena.append_u8(key_names, 0x45)?;
                arena.append_symbol(key_names, pointer)?;
            } else if scancode.prefix == 0xE0 || scancode.code == 0x45 {
                arena.append_u8(key_names_ext, scancode.code)?;
                arena.append_symbol(key_names_ext, pointer)?;
            } else {
                arena.append_u8(key_names, scancode.code)?;
                arena.append_symbol(key_names, pointer)?;
            }
        }
    }
    for &names in &[key_names, key_names_ext] {
        arena.append_u8(names, 0)?;
        arena.append_symbol(names, lptr(arch, None))?;
    }
    for &pairs in &[vsc_to_vk_e0, vsc_to_vk_e1] {
        arena.append_u8(pairs, 0)?;
        arena.append_u16(pairs, 0)?;
    }

    Ok(KeymapBlobs {
        vsc_to_vk,
        vsc_to_vk_e0,
        vsc_to_vk_e1,
        key_names,
        key_names_ext,
    })
}

fn read_name_table(
    view: &ImageView,
    bytes: &[u8],
    warnings: &mut Vec<Warning>,
) -> Result<BTreeMap<u8, String>> {
    let mut names = BTreeMap::new();
    let long_pointer = view.arch.long_pointer();
    let mut reader = BlobReader::new(bytes);
    loop {
        let vsc = reader.read_u8()?;
        if vsc == 0 {
            break;
        }
        let pointer = reader.read_uint(long_pointer, long_pointer)?;
        let rva = pointer.wrapping_sub(view.base) as u32;
        let name = view.extract_wstr(rva)?;
        debug!("key name {:#x} -> {:?}", vsc, name);
        if names.contains_key(&vsc) {
            push_warning(
                warnings,
                Warning::DuplicateEntry(format!("name for vsc {:#x}", vsc)),
            );
            continue;
        }
        names.insert(vsc, name);
    }
    warnings.extend(reader.take_warnings());
    Ok(names)
}

/// Rebuilds `layout.keymap` from the extracted VSC→VK and name tables.
pub fn decompile(
    view: &ImageView,
    vsc_to_vk: &[u8],
    vsc_to_vk_e0: &[u8],
    vsc_to_vk_e1: &[u8],
    key_names: Option<&[u8]>,
    key_names_ext: Option<&[u8]>,
    layout: &mut Layout,
    warnings: &mut Vec<Warning>,
) -> Result<()> {
    let base_names = match key_names {
        Some(bytes) => read_name_table(view, bytes, warnings)?,
        None => BTreeMap::new(),
    };
    let ext_names = match key_names_ext {
        Some(bytes) => read_name_table(view, bytes, warnings)?,
        None => BTreeMap::new(),
    };

    let name_for = |scancode: ScanCode| -> Option<String> {
        if scancode == ScanCode::ext1(0x1D) {
            base_names.get(&0x45).cloned()
        } else if scancode.prefix == 0xE0 || scancode.code == 0x45 {
            ext_names.get(&scancode.code).cloned()
        } else {
            base_names.get(&scancode.code).cloned()
        }
    };

    let mut entries: Vec<(ScanCode, u16)> = Vec::new();
    for (code, chunk) in vsc_to_vk.chunks_exact(2).enumerate() {
        let vk = u16::from_le_bytes([chunk[0], chunk[1]]);
        if vk == 0 || vk == VK_NONE {
            continue;
        }
        entries.push((ScanCode::new(code as u8), vk));
    }
    for (bytes, prefix) in [(vsc_to_vk_e0, 0xE0u8), (vsc_to_vk_e1, 0xE1u8)] {
        let mut reader = BlobReader::new(bytes);
        loop {
            let vsc = reader.read_u8()?;
            if vsc == 0 {
                break;
            }
            let vk = reader.read_u16()?;
            entries.push((ScanCode { prefix, code: vsc }, vk));
        }
        warnings.extend(reader.take_warnings());
    }

    for (scancode, vk) in entries {
        if layout.keymap.contains_key(&scancode) {
            push_warning(
                warnings,
                Warning::DuplicateEntry(format!(
                    "scancode {:#x}-{:#x}",
                    scancode.prefix, scancode.code
                )),
            );
            continue;
        }
        let name = name_for(scancode).filter(|name| *name != default_name(vk));
        layout.keymap.insert(
            scancode,
            KeyCode {
                win_vk: vk,
                name,
                attributes: Default::default(),
            },
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_table_covers_zero_to_max() {
        let mut arena = Arena::new();
        let mut layout = Layout::default();
        layout.keymap.insert(ScanCode::new(0x02), KeyCode::new(0x31));
        layout.keymap.insert(ScanCode::new(0x04), KeyCode::new(0x33));
        let blobs = compile(&mut arena, &layout, Arch::X86).unwrap();
        assert_eq!(
            arena.data(blobs.vsc_to_vk),
            &[0xFF, 0, 0xFF, 0, 0x31, 0, 0xFF, 0, 0x33, 0]
        );
    }

    #[test]
    fn empty_keymap_degenerates_to_one_vacant_entry() {
        let mut arena = Arena::new();
        let layout = Layout::default();
        let blobs = compile(&mut arena, &layout, Arch::X86).unwrap();
        assert_eq!(arena.data(blobs.vsc_to_vk), &[0xFF, 0]);
    }

    #[test]
    fn e0_rows_are_padded_and_terminated() {
        let mut arena = Arena::new();
        let mut layout = Layout::default();
        layout.keymap.insert(ScanCode::new(0x01), KeyCode::new(0x1B));
        layout
            .keymap
            .insert(ScanCode::ext0(0x1D), KeyCode::new(0x11 | 0x100));
        let blobs = compile(&mut arena, &layout, Arch::X86).unwrap();
        // one row of (vsc, pad, vk) plus the zero row
        assert_eq!(
            arena.data(blobs.vsc_to_vk_e0),
            &[0x1D, 0, 0x11, 0x01, 0, 0, 0, 0]
        );
    }

    #[test]
    fn default_names_are_not_emitted() {
        let mut arena = Arena::new();
        let mut layout = Layout::default();
        layout
            .keymap
            .insert(ScanCode::new(0x02), KeyCode::named(0x31, "1"));
        layout
            .keymap
            .insert(ScanCode::new(0x3A), KeyCode::named(0x14, "Caps Lock"));
        let blobs = compile(&mut arena, &layout, Arch::Amd64).unwrap();
        // only Caps Lock survives: "1" equals chr(0x31)
        let data = arena.data(blobs.key_names);
        assert_eq!(data[0], 0x3A);
        assert_eq!(data.len(), 32);
        assert_eq!(arena.symbols(blobs.key_names).len(), 2);
    }

    #[test]
    fn pause_is_named_in_the_base_table() {
        let mut arena = Arena::new();
        let mut layout = Layout::default();
        layout
            .keymap
            .insert(ScanCode::ext1(0x1D), KeyCode::named(0x13, "Pause"));
        layout
            .keymap
            .insert(ScanCode::new(0x45), KeyCode::named(0x90, "Num Lock"));
        let blobs = compile(&mut arena, &layout, Arch::X86).unwrap();
        assert_eq!(arena.data(blobs.key_names)[0], 0x45);
        assert_eq!(arena.data(blobs.key_names_ext)[0], 0x45);
    }
}
