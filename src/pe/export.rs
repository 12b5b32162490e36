//! The export directory and the `KbdLayerDescriptor` thunk.
//!
//! A keyboard DLL exports exactly one function at ordinal 1. The function
//! body is a handful of bytes that return the absolute address of the
//! KBDTABLES struct; the export directory is emitted self-contained, with
//! its address/name/ordinal tables and strings nested inside one blob.

use scroll::{Pread, Pwrite, SizeWith};

use crate::arch::Arch;
use crate::error::{Error, Result, Warning};
use crate::layout::Layout;
use crate::linker::{Arena, BlobId, BlobReader, Symbol};
use crate::pe::ImageView;
use crate::wintypes::astr;

/// The name of the single exported function.
pub const EXPORT_NAME: &str = "KbdLayerDescriptor";

/// In `winnt.h`, `IMAGE_EXPORT_DIRECTORY`.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct ExportDirectory {
    /// Reserved, must be zero.
    pub export_flags: u32,
    /// Time the export data was created.
    pub time_date_stamp: u32,
    /// Unused major version.
    pub major_version: u16,
    /// Unused minor version.
    pub minor_version: u16,
    /// RVA of the DLL name string.
    pub name_rva: u32,
    /// Starting ordinal, 1 here.
    pub ordinal_base: u32,
    /// Number of address table entries.
    pub address_table_entries: u32,
    /// Number of name pointers (and ordinal entries).
    pub number_of_name_pointers: u32,
    /// RVA of the export address table.
    pub export_address_table_rva: u32,
    /// RVA of the name pointer table.
    pub name_pointer_rva: u32,
    /// RVA of the ordinal table.
    pub ordinal_table_rva: u32,
}

/// Builds the function thunk and the self-contained export directory.
pub fn compile(
    arena: &mut Arena,
    layout: &Layout,
    arch: Arch,
    timestamp: u32,
    kbdtables: BlobId,
) -> Result<BlobId> {
    let func = arena.blob(16)?;
    arena.append_bytes(func, arch.thunk_prefix())?;
    // the immediate is packed into the instruction stream, unaligned
    arena.append_symbol_packed(
        func,
        Symbol::pointer(arch.pointer(), arch.image_base(), Some(kbdtables)),
    )?;
    arena.append_bytes(func, arch.thunk_suffix())?;

    let dll_name = astr(arena, &layout.dll_name)?;
    let func_name = astr(arena, EXPORT_NAME)?;

    let addresses = arena.blob(4)?;
    arena.append_symbol(addresses, Symbol::rva(func))?;
    let names = arena.blob(4)?;
    arena.append_symbol(names, Symbol::rva(func_name))?;
    let ordinals = arena.blob(4)?;
    arena.append_u16(ordinals, 0)?;

    let export = arena.blob(16)?;
    arena.append_u32(export, 0)?; // ExportFlags (reserved)
    arena.append_u32(export, timestamp)?;
    arena.append_u16(export, 0)?; // MajorVersion (unused)
    arena.append_u16(export, 0)?; // MinorVersion (unused)
    arena.append_symbol(export, Symbol::rva(dll_name))?;
    arena.append_u32(export, 1)?; // OrdinalBase
    arena.append_u32(export, 1)?; // AddressTableEntries
    arena.append_u32(export, 1)?; // NumberOfNamePointers
    arena.append_symbol(export, Symbol::rva(addresses))?;
    arena.append_symbol(export, Symbol::rva(names))?;
    arena.append_symbol(export, Symbol::rva(ordinals))?;

    // the directory must be self-contained; the thunk itself is reached
    // through the address-table RVA during section layout
    for child in [addresses, names, ordinals, dll_name, func_name] {
        arena.append_blob(export, child)?;
    }
    Ok(export)
}

/// What the export directory and thunk reveal about an image.
#[derive(Debug)]
pub struct ExportInfo {
    /// The DLL's own name from the export directory.
    pub dll_name: String,
    /// RVA of the KBDTABLES struct the thunk returns.
    pub table_rva: u32,
    /// Architecture after thunk analysis (a CDQ in 32-bit code means the
    /// image is the WoW64 variant).
    pub arch: Arch,
}

/// Parses the export directory, verifies the single `KbdLayerDescriptor`
/// export, and matches the thunk against the known instruction patterns.
pub fn parse(
    view: &ImageView,
    directory: (u32, u32),
    warnings: &mut Vec<Warning>,
) -> Result<ExportInfo> {
    let (rva, size) = directory;
    let bytes = view.extract_fixed(rva, size as usize)?;
    let export: ExportDirectory = bytes.pread_with(0, scroll::LE)?;

    let mut reader = BlobReader::new(bytes);
    reader.offset = 16;
    reader.read_or_warn_uint(4, 4, 1, "export OrdinalBase")?;
    reader.read_or_warn_uint(4, 4, 1, "export AddressTableEntries")?;
    reader.read_or_warn_uint(4, 4, 1, "export NumberOfNamePointers")?;
    warnings.extend(reader.take_warnings());

    let dll_name = view.extract_str(export.name_rva)?;

    let name_pointer = view.extract_fixed(export.name_pointer_rva, 4)?;
    let func_name_rva = u32::from_le_bytes([
        name_pointer[0],
        name_pointer[1],
        name_pointer[2],
        name_pointer[3],
    ]);
    let func_name = view.extract_str(func_name_rva)?;
    if func_name != EXPORT_NAME {
        return Err(Error::Malformed(format!(
            "expected the {} export, found {:?}",
            EXPORT_NAME, func_name
        )));
    }

    let address = view.extract_fixed(export.export_address_table_rva, 4)?;
    let func_rva = u32::from_le_bytes([address[0], address[1], address[2], address[3]]);
    // the thunk is at most 11 bytes; 16 leaves room for trailing padding
    let func = view.extract_fixed(func_rva, 16)?;

    let mut arch = view.arch;
    let mut thunk = BlobReader::new(func);
    if arch == Arch::Amd64 {
        thunk.read_or_fail_uint(1, 1, 0x48, "thunk REX.W prefix")?;
    }
    let instruction = thunk.read_u8()?;
    let table_rva = match instruction {
        // MOV EAX/RAX, imm
        0xB8 => {
            let address = thunk.read_uint(arch.pointer(), 1)?;
            let next = thunk.read_u8()?;
            match next {
                0x99 if arch == Arch::X86 => {
                    arch = Arch::Wow64;
                    thunk.read_or_fail_uint(1, 1, 0xC3, "thunk RET")?;
                }
                0x99 => {
                    return Err(Error::Malformed(
                        "unexpected CDQ in a 64-bit thunk".into(),
                    ))
                }
                0xC3 => {}
                other => {
                    return Err(Error::Malformed(format!(
                        "unexpected thunk instruction {:#x}",
                        other
                    )))
                }
            }
            if address < view.base {
                return Err(Error::Malformed(format!(
                    "thunk address {:#x} below image base {:#x}",
                    address, view.base
                )));
            }
            (address - view.base) as u32
        }
        // LEA RAX, [rip + disp32]
        0x8D => {
            thunk.read_or_fail_uint(1, 1, 0x05, "thunk LEA ModRM")?;
            let displacement = thunk.read_uint(4, 1)? as u32;
            let end = thunk.offset as u32;
            thunk.read_or_fail_uint(1, 1, 0xC3, "thunk RET")?;
            func_rva.wrapping_add(end).wrapping_add(displacement)
        }
        other => {
            return Err(Error::Malformed(format!(
                "unexpected thunk instruction {:#x}",
                other
            )))
        }
    };

    Ok(ExportInfo {
        dll_name,
        table_rva,
        arch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thunk_bytes_per_architecture() {
        for (arch, expected) in [
            (Arch::X86, vec![0xB8u8, 0, 0, 0, 0, 0xC3]),
            (Arch::Wow64, vec![0xB8, 0, 0, 0, 0, 0x99, 0xC3]),
            (Arch::Amd64, vec![0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0, 0xC3]),
        ] {
            let mut arena = Arena::new();
            let tables = arena.blob(8).unwrap();
            let layout = Layout {
                dll_name: "kbdtst.dll".into(),
                ..Default::default()
            };
            let export = compile(&mut arena, &layout, arch, 0, tables).unwrap();
            // the thunk is the RVA target of the address table's only entry
            let directory = arena.data(export);
            assert_eq!(&directory[4..8], &0u32.to_le_bytes());
            let func = arena
                .symbols(export)
                .values()
                .filter_map(|symbol| symbol.target)
                .find(|&target| arena.data(target).starts_with(arch.thunk_prefix()))
                .unwrap();
            assert_eq!(arena.data(func), &expected[..]);
        }
    }

    #[test]
    fn directory_is_self_contained() {
        let mut arena = Arena::new();
        let tables = arena.blob(8).unwrap();
        let layout = Layout {
            dll_name: "kbdtst.dll".into(),
            ..Default::default()
        };
        let export = compile(&mut arena, &layout, Arch::X86, 0x5F00_0000, tables).unwrap();
        let data = arena.data(export);
        // timestamp at offset 4
        assert_eq!(&data[4..8], &0x5F00_0000u32.to_le_bytes());
        // both strings are embedded
        let text = String::from_utf8_lossy(data);
        assert!(text.contains("kbdtst.dll"));
        assert!(text.contains(EXPORT_NAME));
    }
}
