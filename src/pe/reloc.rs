//! The base-relocation directory.
//!
//! Every absolute pointer the linker placed into `.data` needs a fix-up
//! entry so the loader can rebase the image. The resolved symbol map of
//! the linked section is exactly that list: each Pointer symbol with a
//! non-null target becomes one entry, grouped into blocks of one section
//! alignment page.
//!
//! The directory itself can only be produced after `.data` is laid out,
//! so it is poured into the already-placed (and until then empty)
//! `.reloc` section rather than linked like the other directories.

use std::collections::BTreeMap;

use log::debug;

use crate::error::Result;
use crate::linker::{Arena, BlobId, SymbolKind};
use crate::pe::SECTION_ALIGNMENT;

/// Relocation type for 32-bit absolute pointers.
pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
/// Relocation type for 64-bit absolute pointers.
pub const IMAGE_REL_BASED_DIR64: u16 = 10;

/// Builds the relocation directory from the linked `.data` section and
/// adopts it into the `.reloc` section.
pub fn compile(arena: &mut Arena, sec_data: BlobId, sec_reloc: BlobId) -> Result<BlobId> {
    let section_base = arena.offset_of(sec_data)?;
    let mut blocks: BTreeMap<usize, Vec<(usize, u16)>> = BTreeMap::new();
    for (&offset, symbol) in arena.symbols(sec_data) {
        if let SymbolKind::Pointer { width, .. } = symbol.kind {
            if symbol.target.is_none() {
                continue;
            }
            let address = section_base + offset;
            let entry_type = if width == 4 {
                IMAGE_REL_BASED_HIGHLOW
            } else {
                IMAGE_REL_BASED_DIR64
            };
            blocks
                .entry(address / SECTION_ALIGNMENT)
                .or_default()
                .push((address % SECTION_ALIGNMENT, entry_type));
        }
    }

    let reloc = arena.blob(4)?;
    for (page, mut entries) in blocks {
        entries.sort();
        let mut length = 8 + 2 * entries.len();
        if entries.len() % 2 == 1 {
            // blocks are 4-aligned; odd counts get a type-0 pad entry
            length += 2;
        }
        debug!(
            "relocation block {:#x}: {} entries",
            page * SECTION_ALIGNMENT,
            entries.len()
        );
        arena.append_u32(reloc, (page * SECTION_ALIGNMENT) as u32)?;
        arena.append_u32(reloc, length as u32)?;
        for (offset, entry_type) in entries {
            arena.append_u16(reloc, (entry_type << 12) | offset as u16)?;
        }
        arena.append_padding(reloc, 4)?;
    }

    arena.adopt(sec_reloc, reloc)?;
    Ok(reloc)
}
