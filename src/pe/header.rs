//! MZ header, DOS stub, COFF and optional headers, and the section table.
//!
//! The compile side emits the headers into one file-aligned blob; fields
//! that depend on the final file layout (the PE-header offset at 0x3C,
//! each section's PointerToRawData, SizeOfHeaders) stay symbols and
//! resolve during the final assembly pass.

use scroll::{Pread, Pwrite, SizeWith};

use crate::arch::{Arch, COFF_MACHINE_X86, COFF_MACHINE_X86_64};
use crate::error::{push_warning, Error, Result, Warning};
use crate::layout::Layout;
use crate::linker::{Arena, BlobId, BlobReader, Symbol};
use crate::pe::{align_up, Config, FILE_ALIGNMENT, SECTION_ALIGNMENT};

/// "MZ".
pub const DOS_MAGIC: &[u8] = b"MZ";
/// Offset of the PE-header pointer in the DOS header.
pub const PE_POINTER_OFFSET: usize = 0x3C;
/// "PE\0\0".
pub const PE_MAGIC: &[u8] = b"PE\0\0";
/// Native subsystem (kernel-mode drivers).
pub const SUBSYSTEM_NATIVE: u16 = 1;
/// DYNAMIC_BASE | NX_COMPAT | NO_SEH.
pub const DLL_CHARACTERISTICS: u16 = 0x0540;
/// All DllCharacteristics bits with a defined meaning.
const KNOWN_DLL_CHARACTERISTICS: u16 = 0xFFE0;

/// The classic DOS stub: print the message via INT 21h/09h, then exit(1).
const DOS_STUB: &[u8] = &[
    0x0E, // PUSH CS
    0x1F, // POP DS
    0xBA, 0x0E, 0x00, // MOV DX, offset 0xE
    0xB4, 0x09, // MOV AH, 0x09
    0xCD, 0x21, // INT 0x21
    0xB8, 0x01, 0x4C, // MOV AX, 0x4C01 (exit(1))
    0xCD, 0x21, // INT 0x21
];
const DOS_MESSAGE: &[u8] = b"This program cannot be run in DOS mode.\n\n\r$";

/// In `winnt.h`, `IMAGE_SECTION_HEADER`.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct SectionHeader {
    /// Section name, zero padded.
    pub name: [u8; 8],
    /// Size of the section once loaded.
    pub virtual_size: u32,
    /// RVA the section loads at.
    pub virtual_address: u32,
    /// Size of the section on disk, file-aligned.
    pub size_of_raw_data: u32,
    /// File offset of the section's bytes.
    pub pointer_to_raw_data: u32,
    /// Unused for images.
    pub pointer_to_relocations: u32,
    /// Unused for images.
    pub pointer_to_linenumbers: u32,
    /// Unused for images.
    pub number_of_relocations: u16,
    /// Unused for images.
    pub number_of_linenumbers: u16,
    /// Section flags.
    pub characteristics: u32,
}

/// The linked section containers, in image order.
#[derive(Debug, Copy, Clone)]
pub struct Sections {
    /// `.data`: export directory, thunk and keyboard tables.
    pub data: BlobId,
    /// `.rsrc`: the resource tree.
    pub rsrc: BlobId,
    /// `.reloc`: the base relocations.
    pub reloc: BlobId,
}

/// The directory blobs the data directories point at.
#[derive(Debug, Copy, Clone)]
pub struct Directories {
    /// Export directory.
    pub export: BlobId,
    /// Resource directory.
    pub resource: BlobId,
    /// Base-relocation directory.
    pub reloc: BlobId,
}

/// The header blob and, nested inside it, the PE header (kept addressable
/// for the checksum patch).
#[derive(Debug, Copy, Clone)]
pub struct HeaderBlobs {
    /// MZ header + stub + banner + PE headers, padded to file alignment.
    pub header: BlobId,
    /// The PE signature + COFF + optional header + section table.
    pub pe: BlobId,
}

fn file_size(arena: &Arena, section: BlobId) -> usize {
    align_up(arena.len(section), FILE_ALIGNMENT)
}

/// Builds the complete header blob.
pub fn compile(
    arena: &mut Arena,
    layout: &Layout,
    arch: Arch,
    config: &Config,
    sections: &Sections,
    directories: &Directories,
) -> Result<HeaderBlobs> {
    let header = arena.blob(FILE_ALIGNMENT)?;

    let section_table = arena.blob(4)?;
    for (name, section, characteristics) in [
        (b".data\0\0\0", sections.data, 0x6000_0040u32), // init data, read, execute
        (b".rsrc\0\0\0", sections.rsrc, 0x4200_0040), // init data, read, discard
        (b".reloc\0\0", sections.reloc, 0x4200_0040), // init data, read, discard
    ] {
        let virtual_size = arena.len(section) as u32;
        let virtual_address = arena.offset_of(section)? as u32;
        let raw_size = file_size(arena, section) as u32;
        arena.append_bytes(section_table, name)?;
        arena.append_u32(section_table, virtual_size)?;
        arena.append_u32(section_table, virtual_address)?;
        arena.append_u32(section_table, raw_size)?;
        arena.append_symbol(section_table, Symbol::rva(section))?;
        arena.append_u32(section_table, 0)?; // PointerToRelocations
        arena.append_u32(section_table, 0)?; // PointerToLinenumbers
        arena.append_u16(section_table, 0)?; // NumberOfRelocations
        arena.append_u16(section_table, 0)?; // NumberOfLinenumbers
        arena.append_u32(section_table, characteristics)?;
    }

    let pointer = arch.pointer();
    let optional = arena.blob(pointer)?;
    arena.append_u16(optional, arch.optional_magic())?;
    let major: u8 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor: u8 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    arena.append_u8(optional, major)?; // MajorLinkerVersion
    arena.append_u8(optional, minor)?; // MinorLinkerVersion
    arena.append_u32(optional, 0)?; // SizeOfCode
    let initialized = file_size(arena, sections.data)
        + file_size(arena, sections.rsrc)
        + file_size(arena, sections.reloc);
    arena.append_u32(optional, initialized as u32)?;
    arena.append_u32(optional, 0)?; // SizeOfUninitializedData
    arena.append_u32(optional, 0)?; // AddressOfEntryPoint
    let data_rva = arena.offset_of(sections.data)? as u32;
    arena.append_u32(optional, data_rva)?; // BaseOfCode
    if pointer == 4 {
        arena.append_u32(optional, data_rva)?; // BaseOfData (PE32 only)
    }
    arena.append_symbol(
        optional,
        Symbol::pointer(pointer, arch.image_base(), Some(header)),
    )?;
    arena.append_u32(optional, SECTION_ALIGNMENT as u32)?;
    arena.append_u32(optional, FILE_ALIGNMENT as u32)?;
    arena.append_u16(optional, 5)?; // MajorOperatingSystemVersion
    arena.append_u16(optional, 1)?; // MinorOperatingSystemVersion
    arena.append_u16(optional, layout.version.0)?;
    arena.append_u16(optional, layout.version.1)?;
    arena.append_u16(optional, 5)?; // MajorSubsystemVersion
    arena.append_u16(optional, 1)?; // MinorSubsystemVersion
    arena.append_u32(optional, 0)?; // Win32VersionValue (reserved)
    // the .reloc section is assumed shorter than one section alignment
    let image_size = arena.offset_of(sections.reloc)? + SECTION_ALIGNMENT;
    arena.append_u32(optional, image_size as u32)?;
    arena.append_symbol(optional, Symbol::sizeof(4, header))?;
    arena.append_u32(optional, 0)?; // CheckSum, patched after assembly
    arena.append_u16(optional, SUBSYSTEM_NATIVE)?;
    arena.append_u16(optional, DLL_CHARACTERISTICS)?;
    arena.append_uint(optional, 0x0004_0000, pointer)?; // SizeOfStackReserve
    arena.append_uint(optional, 0x0000_1000, pointer)?; // SizeOfStackCommit
    arena.append_uint(optional, 0x0010_0000, pointer)?; // SizeOfHeapReserve
    arena.append_uint(optional, 0x0000_1000, pointer)?; // SizeOfHeapCommit
    arena.append_u32(optional, 0)?; // LoaderFlags (reserved)
    let slots: [Option<BlobId>; 16] = [
        Some(directories.export), // Export
        None,                     // Import
        Some(directories.resource), // Resource
        None,                     // Exception
        None,                     // Certificate
        Some(directories.reloc),  // Base Relocation
        None,                     // Debug
        None,                     // Architecture
        None,                     // Global Ptr
        None,                     // TLS
        None,                     // Load Config
        None,                     // Bound Import
        None,                     // IAT
        None,                     // Delay Import
        None,                     // CLR Runtime
        None,                     // (reserved)
    ];
    arena.append_u32(optional, slots.len() as u32)?;
    for slot in slots {
        match slot {
            Some(directory) => {
                let rva = arena.offset_of(directory)? as u32;
                arena.append_u32(optional, rva)?;
                arena.append_symbol(optional, Symbol::sizeof(4, directory))?;
            }
            None => {
                arena.append_u32(optional, 0)?;
                arena.append_u32(optional, 0)?;
            }
        }
    }

    let coff = arena.blob(4)?;
    arena.append_u16(coff, arch.machine())?;
    arena.append_u16(coff, 3)?; // NumberOfSections
    arena.append_u32(coff, config.timestamp)?;
    arena.append_u32(coff, 0)?; // PointerToSymbolTable (deprecated)
    arena.append_u32(coff, 0)?; // NumberOfSymbols (deprecated)
    let optional_size = arena.len(optional) as u16;
    arena.append_u16(coff, optional_size)?;
    arena.append_u16(coff, arch.characteristics())?;

    let pe = arena.blob(8)?;
    arena.append_bytes(pe, PE_MAGIC)?;
    arena.append_blob(pe, coff)?;
    arena.append_blob(pe, optional)?;
    arena.append_blob(pe, section_table)?;

    let mz = arena.blob(16)?;
    arena.append_bytes(mz, DOS_MAGIC)?;
    arena.append_u16(mz, 0x90)?; // bytes on last page
    arena.append_u16(mz, 3)?; // pages in file
    arena.append_u16(mz, 0)?; // relocation entries
    arena.append_u16(mz, 4)?; // header paragraphs
    arena.append_u16(mz, 0)?; // min extra paragraphs
    arena.append_u16(mz, 0xFFFF)?; // max extra paragraphs
    arena.append_u16(mz, 0)?; // initial SS
    arena.append_u16(mz, 0xB8)?; // initial SP
    arena.append_u16(mz, 0)?; // checksum
    arena.append_u32(mz, 0)?; // initial CS:IP
    arena.append_u16(mz, 0x40)?; // relocation table offset
    arena.append_u16(mz, 0)?; // overlay number
    arena.append_bytes(mz, &[0u8; 32])?;
    debug_assert_eq!(arena.len(mz), PE_POINTER_OFFSET);
    arena.append_symbol(mz, Symbol::rva(pe))?;
    arena.append_bytes(mz, DOS_STUB)?;
    arena.append_bytes(mz, DOS_MESSAGE)?;

    let generator = match &config.generator {
        Some(generator) => generator.clone(),
        None => concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")).to_string(),
    };
    let banner = arena.blob(16)?;
    let mut text = format!("Generated with {} for {}", generator, arch.name());
    if !text.is_ascii() {
        text = text.replace(|c: char| !c.is_ascii(), "?");
    }
    arena.append_bytes(banner, text.as_bytes())?;
    arena.append_u8(banner, 0)?;

    arena.append_blob(header, mz)?;
    arena.append_blob(header, banner)?;
    arena.append_blob(header, pe)?;
    arena.append_padding(header, FILE_ALIGNMENT)?;

    Ok(HeaderBlobs { header, pe })
}

/// Everything the headers reveal about an image being decompiled.
#[derive(Debug)]
pub struct ParsedImage {
    /// Architecture from the COFF machine (X86 may still turn out to be
    /// WoW64 once the thunk is read).
    pub arch: Arch,
    /// Image base from the optional header.
    pub image_base: u64,
    /// COFF timestamp.
    pub timestamp: u32,
    /// (virtual address, file offset) per section, sorted by address.
    pub sections: Vec<(u32, u32)>,
    /// Export data directory (rva, size).
    pub export_dir: (u32, u32),
    /// Resource data directory, if present.
    pub resource_dir: Option<(u32, u32)>,
}

/// Parses the MZ / COFF / optional headers and the section table.
pub fn parse(data: &[u8], warnings: &mut Vec<Warning>) -> Result<ParsedImage> {
    let mut reader = BlobReader::new(data);
    reader.read_or_fail_bytes(DOS_MAGIC, "DOS signature")?;
    reader.offset = PE_POINTER_OFFSET;
    let pe_pointer = reader.read_u32()? as usize;
    reader.offset = pe_pointer;
    reader.read_or_fail_bytes(PE_MAGIC, "PE signature")?;

    let machine = reader.read_u16()?;
    let arch = match machine {
        COFF_MACHINE_X86 => Arch::X86,
        COFF_MACHINE_X86_64 => Arch::Amd64,
        _ => return Err(Error::Malformed(format!("unknown machine {:#x}", machine))),
    };
    let section_count = reader.read_u16()? as usize;
    let timestamp = reader.read_u32()?;
    reader.read_u32()?; // PointerToSymbolTable (deprecated)
    reader.read_u32()?; // NumberOfSymbols (deprecated)
    let optional_size = reader.read_u16()? as usize;
    reader.read_or_warn_uint(
        2,
        2,
        arch.characteristics() as u64,
        "COFF Characteristics",
    )?;
    let optional_start = reader.offset;
    let optional_end = optional_start + optional_size;

    reader.read_or_fail_uint(2, 1, arch.optional_magic() as u64, "optional header magic")?;
    // linker versions and the standard size/base fields
    reader.offset += if arch.pointer() == 4 { 26 } else { 22 };
    let image_base = reader.read_uint(arch.pointer(), 1)?;
    reader.read_or_warn_uint(4, 1, SECTION_ALIGNMENT as u64, "SectionAlignment")?;
    reader.read_or_warn_uint(4, 1, FILE_ALIGNMENT as u64, "FileAlignment")?;
    reader.offset += 12; // OS, image and subsystem versions
    reader.read_u32()?; // Win32VersionValue
    reader.read_u32()?; // SizeOfImage
    reader.read_u32()?; // SizeOfHeaders
    reader.read_u32()?; // CheckSum
    let subsystem = reader.read_u16()?;
    if subsystem != SUBSYSTEM_NATIVE {
        push_warning(warnings, Warning::UnknownSubsystem(subsystem));
    }
    let dll_characteristics = reader.read_u16()?;
    if dll_characteristics & !KNOWN_DLL_CHARACTERISTICS != 0 {
        push_warning(
            warnings,
            Warning::UnknownDllCharacteristics(dll_characteristics),
        );
    }
    reader.offset += 4 * arch.pointer(); // stack and heap sizes
    reader.read_u32()?; // LoaderFlags

    let directory_count = reader.read_u32()? as usize;
    if directory_count < 1 {
        return Err(Error::Malformed("no export directory in image".into()));
    }
    let export_rva = reader.read_u32()?;
    let export_size = reader.read_u32()?;
    if export_rva == 0 {
        return Err(Error::Malformed("no export directory in image".into()));
    }
    let resource_dir = if directory_count >= 3 {
        reader.offset += 8; // import directory
        let resource_rva = reader.read_u32()?;
        let resource_size = reader.read_u32()?;
        (resource_rva != 0).then_some((resource_rva, resource_size))
    } else {
        None
    };
    if reader.offset > optional_end {
        return Err(Error::Malformed("SizeOfOptionalHeader too low".into()));
    }

    reader.offset = optional_end;
    let mut sections = Vec::with_capacity(section_count);
    for _ in 0..section_count {
        let section: SectionHeader = reader.read_value()?;
        sections.push((section.virtual_address, section.pointer_to_raw_data));
    }
    sections.sort_unstable();
    warnings.extend(reader.take_warnings());

    Ok(ParsedImage {
        arch,
        image_base,
        timestamp,
        sections,
        export_dir: (export_rva, export_size),
        resource_dir,
    })
}
