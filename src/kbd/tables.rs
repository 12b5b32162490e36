//! The top-level KBDTABLES struct: long pointers to every keyboard table
//! plus the locale flags and (unused) ligature fields.
//!
//! The exported `KbdLayerDescriptor` thunk returns the absolute address of
//! this struct; everything else is reachable from it.

use log::debug;

use crate::arch::Arch;
use crate::error::{push_warning, Error, Result, Warning};
use crate::kbd::charmap::CharmapBlobs;
use crate::kbd::keymap::KeymapBlobs;
use crate::linker::{Arena, BlobId, BlobReader, Symbol};
use crate::pe::ImageView;
use crate::wintypes::{makelong, u8_len};

/// Builds the KBDTABLES blob referencing the keymap and charmap tables.
pub fn compile(
    arena: &mut Arena,
    arch: Arch,
    keymap: &KeymapBlobs,
    charmap: &CharmapBlobs,
) -> Result<BlobId> {
    let long_pointer = arch.long_pointer();
    let base = arch.image_base();
    let lptr = |target: Option<BlobId>| Symbol::pointer(long_pointer, base, target);

    let tables = arena.blob(long_pointer)?;
    arena.append_symbol(tables, lptr(Some(charmap.modifiers)))?;
    arena.append_symbol(tables, lptr(Some(charmap.vk_to_wchar_table)))?;
    arena.append_symbol(tables, lptr(Some(charmap.dead_key)))?;
    arena.append_symbol(tables, lptr(Some(keymap.key_names)))?;
    arena.append_symbol(tables, lptr(Some(keymap.key_names_ext)))?;
    arena.append_symbol(tables, lptr(Some(charmap.key_names_dead)))?;
    arena.append_symbol(tables, lptr(Some(keymap.vsc_to_vk)))?;
    arena.append_u8(tables, u8_len(arena.len(keymap.vsc_to_vk) / 2)?)?;
    arena.append_symbol(tables, lptr(Some(keymap.vsc_to_vk_e0)))?;
    arena.append_symbol(tables, lptr(Some(keymap.vsc_to_vk_e1)))?;
    arena.append_u32(tables, makelong(1, 1))?;
    arena.append_u8(tables, 0)?;
    arena.append_u8(tables, 0)?;
    arena.append_symbol(tables, lptr(None))?;
    arena.append_u32(tables, 0)?;
    arena.append_u32(tables, 0)?;
    Ok(tables)
}

/// The raw bytes of each keyboard table, pulled out of a loaded image.
#[derive(Debug, Default)]
pub struct KbdTableBytes {
    /// MODIFIERS (exact size, derived from wMaxModBits).
    pub modifiers: Vec<u8>,
    /// VK_TO_WCHAR_TABLE rows up to and including the null row.
    pub vk_to_wchar_table: Vec<u8>,
    /// DEADKEY rows, when the table pointer is non-null.
    pub dead_key: Option<Vec<u8>>,
    /// Base key-name rows.
    pub key_names: Option<Vec<u8>>,
    /// Extended key-name rows.
    pub key_names_ext: Option<Vec<u8>>,
    /// Dead-key name pointers.
    pub key_names_dead: Option<Vec<u8>>,
    /// Flat VSC→VK table, 2 * bMaxVSCtoVK bytes.
    pub vsc_to_vk: Vec<u8>,
    /// (vsc, vk) rows for 0xE0 scancodes.
    pub vsc_to_vk_e0: Vec<u8>,
    /// (vsc, vk) rows for 0xE1 scancodes.
    pub vsc_to_vk_e1: Vec<u8>,
}

/// Reads the KBDTABLES struct at `table_bytes` and extracts every table it
/// points at. Pointer fields are followed only after the scalar fields
/// they depend on have been read (`bMaxVSCtoVK` bounds `pusVSCtoVK`).
pub fn decompile(
    view: &ImageView,
    table_bytes: &[u8],
    warnings: &mut Vec<Warning>,
) -> Result<KbdTableBytes> {
    let long_pointer = view.arch.long_pointer();
    let mut reader = BlobReader::new(table_bytes);

    let required = |pointer: u64, what: &str| -> Result<u32> {
        if pointer == 0 {
            return Err(Error::Malformed(format!("KBDTABLES has a null {}", what)));
        }
        Ok(pointer.wrapping_sub(view.base) as u32)
    };

    let modifiers_rva = required(
        reader.read_uint(long_pointer, long_pointer)?,
        "pCharModifiers",
    )?;
    // sized by wMaxModBits, which sits after the VK_TO_BIT pointer
    let max_mask_bytes = view.extract_fixed(modifiers_rva + long_pointer as u32, 2)?;
    let max_mask = u16::from_le_bytes([max_mask_bytes[0], max_mask_bytes[1]]) as usize;
    let modifiers = view
        .extract_fixed(modifiers_rva, long_pointer + 2 + max_mask + 1)?
        .to_vec();

    let table_rva = required(
        reader.read_uint(long_pointer, long_pointer)?,
        "pVkToWcharTable",
    )?;
    let vk_to_wchar_table = view.extract_array(table_rva, 2 * long_pointer)?.0;

    let optional_array = |reader: &mut BlobReader, entry: usize| -> Result<Option<Vec<u8>>> {
        let pointer = reader.read_uint(long_pointer, long_pointer)?;
        if pointer == 0 {
            return Ok(None);
        }
        let rva = pointer.wrapping_sub(view.base) as u32;
        Ok(Some(view.extract_array(rva, entry)?.0))
    };

    let dead_key = optional_array(&mut reader, 8)?;
    let key_names = optional_array(&mut reader, 2 * long_pointer)?;
    let key_names_ext = optional_array(&mut reader, 2 * long_pointer)?;
    let key_names_dead = optional_array(&mut reader, long_pointer)?;

    let vsc_to_vk_rva = required(
        reader.read_uint(long_pointer, long_pointer)?,
        "pusVSCtoVK",
    )?;
    let max_vsc = reader.read_u8()? as usize;
    let vsc_to_vk = view.extract_fixed(vsc_to_vk_rva, 2 * max_vsc)?.to_vec();

    let e0_rva = required(
        reader.read_uint(long_pointer, long_pointer)?,
        "pVSCtoVK_E0",
    )?;
    let vsc_to_vk_e0 = view.extract_array(e0_rva, 4)?.0;
    let e1_rva = required(
        reader.read_uint(long_pointer, long_pointer)?,
        "pVSCtoVK_E1",
    )?;
    let vsc_to_vk_e1 = view.extract_array(e1_rva, 4)?.0;

    let locale_flags = reader.read_u32()?;
    debug!("fLocaleFlags {:#x}", locale_flags);
    let _n_lg_max = reader.read_u8()?;
    let _cb_lg_entry = reader.read_u8()?;
    let ligature = reader.read_uint(long_pointer, long_pointer)?;
    if ligature != 0 {
        push_warning(warnings, Warning::LigatureTableIgnored);
    }
    let _dw_type = reader.read_u32()?;
    let _dw_sub_type = reader.read_u32()?;
    warnings.extend(reader.take_warnings());

    Ok(KbdTableBytes {
        modifiers,
        vk_to_wchar_table,
        dead_key,
        key_names,
        key_names_ext,
        key_names_dead,
        vsc_to_vk,
        vsc_to_vk_e0,
        vsc_to_vk_e1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kbd::{charmap, keymap};
    use crate::layout::Layout;

    fn build(arch: Arch) -> (Arena, BlobId) {
        let mut arena = Arena::new();
        let mut warnings = Vec::new();
        let layout = Layout::default();
        let keymap_blobs = keymap::compile(&mut arena, &layout, arch).unwrap();
        let charmap_blobs = charmap::compile(&mut arena, &layout, arch, &mut warnings).unwrap();
        let tables = compile(&mut arena, arch, &keymap_blobs, &charmap_blobs).unwrap();
        (arena, tables)
    }

    #[test]
    fn struct_size_matches_extraction_window() {
        let (arena, tables) = build(Arch::X86);
        assert_eq!(arena.len(tables), 11 * 4 + 16);
        let (arena, tables) = build(Arch::Amd64);
        assert_eq!(arena.len(tables), 11 * 8 + 16);
        let (arena, tables) = build(Arch::Wow64);
        assert_eq!(arena.len(tables), 11 * 8 + 16);
    }

    #[test]
    fn count_and_flags_fields() {
        let (arena, tables) = build(Arch::Amd64);
        let data = arena.data(tables);
        // bMaxVSCtoVK right after the seven table pointers
        assert_eq!(data[56], 1);
        // fLocaleFlags = MAKELONG(1, 1)
        assert_eq!(&data[80..84], &[1, 0, 1, 0]);
        // ligature pointer is null
        assert_eq!(&data[88..96], &[0; 8]);
    }
}
