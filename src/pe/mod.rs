//! The PE assembler and parser.
//!
//! [`compile`] turns a [`Layout`] into a complete PE32 / PE32+ keyboard
//! DLL image: the keyboard tables and export directory become `.data`, the
//! version resource becomes `.rsrc`, the base relocations become `.reloc`,
//! and the MZ / COFF / optional headers are prepended. [`decompile`] runs
//! every step in reverse.
//!
//! Layout happens in two passes over the same blob arena. The sections are
//! first linked at their virtual addresses, which resolves every pointer,
//! RVA and size symbol. The linked sections are then re-linked (with the
//! header) at file offsets to form the final byte image; only the deferred
//! file-offset RVAs (PointerToRawData, the PE-header offset) resolve in
//! that second pass.

pub mod checksum;
pub mod export;
pub mod header;
pub mod reloc;
pub mod resource;

use log::debug;

use crate::arch::Arch;
use crate::error::{push_warning, Error, Result, Warning};
use crate::kbd;
use crate::layout::Layout;
use crate::linker::Arena;
use crate::wintypes::utf16_bytes_to_string;

/// Virtual alignment of sections.
pub const SECTION_ALIGNMENT: usize = 0x1000;
/// File alignment of sections.
pub const FILE_ALIGNMENT: usize = 0x200;

/// Per-compile configuration; all of it comes from the caller so that a
/// compile is a pure function of its inputs.
#[derive(Debug, Clone)]
pub struct Config {
    /// 32-bit Unix timestamp written to the COFF and export headers.
    pub timestamp: u32,
    /// Generator string for the banner between the DOS stub and the PE
    /// header; the crate name and version when `None`.
    pub generator: Option<String>,
    /// Compute and patch the PE checksum. Disable for bit-for-bit parity
    /// with images that carry a zero checksum.
    pub fix_checksum: bool,
}

impl Config {
    /// A default configuration for the given timestamp.
    pub fn new(timestamp: u32) -> Self {
        Config {
            timestamp,
            generator: None,
            fix_checksum: true,
        }
    }
}

/// The product of a successful compile.
#[derive(Debug)]
pub struct Compiled {
    /// The complete DLL image.
    pub bytes: Vec<u8>,
    /// Recoverable oddities encountered along the way.
    pub warnings: Vec<Warning>,
}

/// The product of a successful decompile.
#[derive(Debug)]
pub struct Decompiled {
    /// The reconstructed layout.
    pub layout: Layout,
    /// The architecture the image was built for.
    pub arch: Arch,
    /// The COFF timestamp.
    pub timestamp: u32,
    /// Recoverable oddities encountered along the way.
    pub warnings: Vec<Warning>,
}

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

/// Compiles `layout` into a keyboard DLL image for `arch`.
pub fn compile(layout: &Layout, arch: Arch, config: &Config) -> Result<Compiled> {
    layout.validate()?;
    let mut warnings = Vec::new();
    let mut arena = Arena::new();

    let keymap_blobs = kbd::keymap::compile(&mut arena, layout, arch)?;
    let charmap_blobs = kbd::charmap::compile(&mut arena, layout, arch, &mut warnings)?;
    let kbdtables = kbd::tables::compile(&mut arena, arch, &keymap_blobs, &charmap_blobs)?;

    let dir_export = export::compile(&mut arena, layout, arch, config.timestamp, kbdtables)?;
    let dir_resource = resource::compile(&mut arena, layout)?;

    let mut base = SECTION_ALIGNMENT;
    let sec_data = arena.link(&[dir_export], base)?;
    arena.set_alignment(sec_data, FILE_ALIGNMENT)?;
    base = align_up(base + arena.len(sec_data), SECTION_ALIGNMENT);
    let sec_rsrc = arena.link(&[dir_resource], base)?;
    arena.set_alignment(sec_rsrc, FILE_ALIGNMENT)?;
    base = align_up(base + arena.len(sec_rsrc), SECTION_ALIGNMENT);
    let sec_reloc = arena.link(&[], base)?;
    arena.set_alignment(sec_reloc, FILE_ALIGNMENT)?;

    let dir_reloc = reloc::compile(&mut arena, sec_data, sec_reloc)?;

    let sections = header::Sections {
        data: sec_data,
        rsrc: sec_rsrc,
        reloc: sec_reloc,
    };
    let directories = header::Directories {
        export: dir_export,
        resource: dir_resource,
        reloc: dir_reloc,
    };
    let blobs = header::compile(&mut arena, layout, arch, config, &sections, &directories)?;

    let tail = arena.blob(FILE_ALIGNMENT)?;
    let assembly = arena.link(&[blobs.header, sec_data, sec_rsrc, sec_reloc, tail], 0)?;
    let mut bytes = arena.data(assembly).to_vec();
    if config.fix_checksum {
        let pe_offset = arena.offset_of(blobs.pe)?;
        checksum::patch(&mut bytes, pe_offset)?;
    }
    debug!("compiled {} bytes for {}", bytes.len(), arch);
    Ok(Compiled { bytes, warnings })
}

/// Decompiles a keyboard DLL image back into a [`Layout`].
pub fn decompile(data: &[u8]) -> Result<Decompiled> {
    let mut warnings = Vec::new();
    let parsed = header::parse(data, &mut warnings)?;
    let mut view = ImageView {
        data,
        sections: parsed.sections,
        base: parsed.image_base,
        arch: parsed.arch,
    };

    let export_info = export::parse(&view, parsed.export_dir, &mut warnings)?;
    view.arch = export_info.arch;
    if view.base != view.arch.image_base() {
        push_warning(
            &mut warnings,
            Warning::NonPreferredBase {
                found: view.base,
                preferred: view.arch.image_base(),
            },
        );
    }

    let mut layout = Layout::default();
    layout.dll_name = export_info.dll_name;

    let table_size = 11 * view.arch.long_pointer() + 16;
    let table_bytes = view.extract_fixed(export_info.table_rva, table_size)?.to_vec();
    let tables = kbd::tables::decompile(&view, &table_bytes, &mut warnings)?;
    kbd::keymap::decompile(
        &view,
        &tables.vsc_to_vk,
        &tables.vsc_to_vk_e0,
        &tables.vsc_to_vk_e1,
        tables.key_names.as_deref(),
        tables.key_names_ext.as_deref(),
        &mut layout,
        &mut warnings,
    )?;
    kbd::charmap::decompile(
        &view,
        &tables.modifiers,
        &tables.vk_to_wchar_table,
        tables.dead_key.as_deref(),
        tables.key_names_dead.as_deref(),
        &mut layout,
        &mut warnings,
    )?;

    match parsed.resource_dir {
        Some(directory) => resource::parse(&view, directory, &mut layout, &mut warnings)?,
        None => push_warning(&mut warnings, Warning::MissingResourceDirectory),
    }

    Ok(Decompiled {
        layout,
        arch: view.arch,
        timestamp: parsed.timestamp,
        warnings,
    })
}

/// Maps relative virtual addresses of a loaded-image layout back into file
/// offsets of the raw bytes being decompiled.
#[derive(Debug)]
pub struct ImageView<'a> {
    /// The whole image file.
    pub data: &'a [u8],
    /// (virtual address, file offset) per section, sorted by address.
    pub sections: Vec<(u32, u32)>,
    /// Image base from the optional header.
    pub base: u64,
    /// Architecture, final after thunk analysis.
    pub arch: Arch,
}

impl<'a> ImageView<'a> {
    fn file_offset(&self, rva: u32) -> Result<usize> {
        let index = self.sections.partition_point(|&(address, _)| address <= rva);
        if index == 0 {
            return Err(Error::Malformed(format!(
                "rva {:#x} precedes the first section",
                rva
            )));
        }
        let (address, offset) = self.sections[index - 1];
        Ok(offset as usize + (rva - address) as usize)
    }

    /// The `size` bytes at `rva`.
    pub fn extract_fixed(&self, rva: u32, size: usize) -> Result<&'a [u8]> {
        let offset = self.file_offset(rva)?;
        if offset + size > self.data.len() {
            return Err(Error::Malformed(format!(
                "{} bytes at rva {:#x} run past the end of the image",
                size, rva
            )));
        }
        Ok(&self.data[offset..offset + size])
    }

    /// Reads `entry_size`-byte entries at `rva` until an all-zero entry.
    /// Returns the bytes including the terminator and the entry count
    /// excluding it.
    pub fn extract_array(&self, rva: u32, entry_size: usize) -> Result<(Vec<u8>, usize)> {
        if entry_size == 0 {
            return Err(Error::Malformed(format!(
                "zero-sized array entries at rva {:#x}",
                rva
            )));
        }
        let mut data = Vec::new();
        let mut count = 0;
        loop {
            let entry = self.extract_fixed(rva + (count * entry_size) as u32, entry_size)?;
            data.extend_from_slice(entry);
            if entry.iter().all(|&byte| byte == 0) {
                break;
            }
            count += 1;
        }
        Ok((data, count))
    }

    /// Reads a null-terminated UTF-16LE string at `rva`.
    pub fn extract_wstr(&self, rva: u32) -> Result<String> {
        let (bytes, _) = self.extract_array(rva, 2)?;
        Ok(utf16_bytes_to_string(&bytes))
    }

    /// Reads a null-terminated ASCII string at `rva`.
    pub fn extract_str(&self, rva: u32) -> Result<String> {
        let (bytes, _) = self.extract_array(rva, 1)?;
        String::from_utf8(bytes[..bytes.len().saturating_sub(1)].to_vec())
            .map_err(|_| Error::Malformed(format!("non-UTF-8 string at rva {:#x}", rva)))
    }
}
