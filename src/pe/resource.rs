//! The `.rsrc` directory tree and the VS_VERSIONINFO resource.
//!
//! A resource directory is a tree of tables; each row points either at a
//! data entry or, with the high bit of its offset set, at a sub-table.
//! Name rows come first (sorted lexicographically), then ID rows (sorted
//! numerically). All offsets are relative to the start of the resource
//! section, so they are resolved eagerly while the tree is still its own
//! root, before section layout.
//!
//! A keyboard DLL carries a single resource: RT_VERSION → name 1 →
//! language 0x0409 → VS_VERSIONINFO.

use std::collections::BTreeMap;

use log::debug;
use scroll::{Pread, Pwrite, SizeWith};

use crate::error::{push_warning, Error, Result, Warning};
use crate::layout::Layout;
use crate::linker::{Arena, BlobId, BlobReader, Symbol, SymbolKind};
use crate::pe::ImageView;
use crate::wintypes::{makelong, utf16_bytes_to_string, utf16_units, u16_len};

/// Windows resource type identifier for version information.
pub const RT_VERSION: u32 = 16;
/// [`VsFixedFileInfo::signature`] must hold this value.
pub const VS_FFI_SIGNATURE: u32 = 0xFEEF04BD;
/// [`VsFixedFileInfo::struct_version`]: structure version 1.0.
pub const VS_FFI_STRUCVERSION: u32 = 0x0001_0000;
/// [`VsFixedFileInfo::file_os`]: Windows NT with Win32 API.
pub const VOS_NT_WINDOWS32: u32 = 0x0004_0004;
/// [`VsFixedFileInfo::file_type`]: a dynamic link library.
pub const VFT_DLL: u32 = 0x0000_0002;
/// [`VsFixedFileInfo::file_subtype`]: a keyboard driver.
pub const VFT2_DRV_KEYBOARD: u32 = 0x0000_0002;
/// The UTF-16 codepage named by the string-table key and Translation var.
pub const CP_UTF16: u16 = 0x04B0;
/// The language named by the Translation var (US English).
pub const LANG_EN_US: u16 = 0x0409;

/// The fixed numeric half of VS_VERSIONINFO; `VS_FIXEDFILEINFO` in
/// `verrsrc.h`.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct VsFixedFileInfo {
    /// Must equal [`VS_FFI_SIGNATURE`].
    pub signature: u32,
    /// Structure version.
    pub struct_version: u32,
    /// File version, most significant half (major << 16 | minor).
    pub file_version_ms: u32,
    /// File version, least significant half (build << 16 | revision).
    pub file_version_ls: u32,
    /// Product version, most significant half.
    pub product_version_ms: u32,
    /// Product version, least significant half.
    pub product_version_ls: u32,
    /// Mask of valid bits in `file_flags`.
    pub file_flags_mask: u32,
    /// Build characteristics (debug, prerelease, ...).
    pub file_flags: u32,
    /// Target operating system.
    pub file_os: u32,
    /// File type.
    pub file_type: u32,
    /// File subtype; the driver kind for VFT_DRV.
    pub file_subtype: u32,
    /// Creation date, most significant half (unused).
    pub file_date_ms: u32,
    /// Creation date, least significant half (unused).
    pub file_date_ls: u32,
}

/// A data-entry row; `IMAGE_RESOURCE_DATA_ENTRY` in `winnt.h`.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct ResourceDataEntry {
    /// RVA of the resource bytes (despite the field's traditional name).
    pub offset_to_data: u32,
    /// Size of the resource bytes.
    pub size: u32,
    /// Code page of the resource bytes.
    pub code_page: u32,
    /// Reserved, zero.
    pub reserved: u32,
}

/// A key in a resource table: named entries sort before ID entries.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ResourceKey {
    /// A numeric identifier.
    Id(u32),
    /// A counted UTF-16 name.
    Name(String),
}

/// One node of a resource tree being emitted.
#[derive(Debug)]
pub enum ResourceNode {
    /// An inner table of keyed entries.
    Directory(Vec<(ResourceKey, ResourceNode)>),
    /// A leaf pointing at resource bytes that live elsewhere in the
    /// section.
    Data {
        /// The resource bytes.
        blob: BlobId,
        /// Code page recorded in the data entry.
        codepage: u32,
    },
}

fn build_table(
    arena: &mut Arena,
    entries: &[(ResourceKey, ResourceNode)],
    strings: &mut Vec<BlobId>,
) -> Result<BlobId> {
    let mut names: Vec<(&String, &ResourceNode)> = Vec::new();
    let mut ids: Vec<(u32, &ResourceNode)> = Vec::new();
    for (key, node) in entries {
        match key {
            ResourceKey::Name(name) => names.push((name, node)),
            ResourceKey::Id(id) => ids.push((*id, node)),
        }
    }
    names.sort_by(|a, b| a.0.cmp(b.0));
    ids.sort_by_key(|entry| entry.0);

    let table = arena.blob(4)?;
    arena.append_u32(table, 0)?; // Characteristics
    arena.append_u32(table, 0)?; // TimeDateStamp
    arena.append_u16(table, 0)?; // MajorVersion
    arena.append_u16(table, 0)?; // MinorVersion
    arena.append_u16(table, u16_len(names.len())?)?;
    arena.append_u16(table, u16_len(ids.len())?)?;

    let mut children = Vec::new();
    let row = |arena: &mut Arena,
                   children: &mut Vec<BlobId>,
                   strings: &mut Vec<BlobId>,
                   node: &ResourceNode|
     -> Result<()> {
        match node {
            ResourceNode::Directory(entries) => {
                let subtable = build_table(arena, entries, strings)?;
                arena.append_symbol(table, Symbol::resource_offset(subtable, true))?;
                children.push(subtable);
            }
            ResourceNode::Data { blob, codepage } => {
                let entry = arena.blob(4)?;
                arena.append_symbol(entry, Symbol::rva(*blob))?;
                arena.append_u32(entry, arena.len(*blob) as u32)?;
                arena.append_u32(entry, *codepage)?;
                arena.append_u32(entry, 0)?;
                arena.append_symbol(table, Symbol::resource_offset(entry, false))?;
                children.push(entry);
            }
        }
        Ok(())
    };

    for (name, node) in names {
        // IMAGE_RESOURCE_DIR_STRING_U: counted, no terminator
        let name_blob = arena.blob(2)?;
        arena.append_u16(name_blob, u16_len(name.chars().count())?)?;
        for unit in utf16_units(name)? {
            arena.append_u16(name_blob, unit)?;
        }
        strings.push(name_blob);
        arena.append_symbol(table, Symbol::resource_offset(name_blob, false))?;
        row(arena, &mut children, strings, node)?;
    }
    for (id, node) in ids {
        arena.append_u32(table, id)?;
        row(arena, &mut children, strings, node)?;
    }

    for child in children {
        arena.append_blob(table, child)?;
    }
    Ok(table)
}

/// Builds a resource tree and resolves its internal offsets, which are
/// relative to the tree root rather than to the image.
pub fn build_tree(arena: &mut Arena, entries: &[(ResourceKey, ResourceNode)]) -> Result<BlobId> {
    let root = arena.blob(4)?;
    let mut strings = Vec::new();
    let table = build_table(arena, entries, &mut strings)?;
    arena.append_blob(root, table)?;
    for string in strings {
        arena.append_blob(root, string)?;
    }
    let offsets: Vec<(usize, Symbol)> = arena
        .symbols(root)
        .iter()
        .filter(|(_, symbol)| matches!(symbol.kind, SymbolKind::ResourceOffset { .. }))
        .map(|(&offset, &symbol)| (offset, symbol))
        .collect();
    for (offset, symbol) in offsets {
        let value = arena.resolve(&symbol)? as u32;
        arena.patch_u32(root, offset, value)?;
        arena.remove_symbol(root, offset);
    }
    Ok(root)
}

fn append_wsz(arena: &mut Arena, blob: BlobId, text: &str) -> Result<()> {
    for unit in utf16_units(text)? {
        arena.append_u16(blob, unit)?;
    }
    arena.append_u16(blob, 0)
}

fn finish_node(arena: &mut Arena, node: BlobId) -> Result<()> {
    let length = u16_len(arena.len(node))?;
    arena.patch_u16(node, 0, length)
}

fn version_string_table(arena: &mut Arena, layout: &Layout) -> Result<BlobId> {
    let version = format!("{}.{}", layout.version.0, layout.version.1);
    let stem = layout.dll_name.strip_suffix(".dll").unwrap_or(&layout.dll_name);
    let strings: BTreeMap<&str, &str> = BTreeMap::from([
        ("CompanyName", layout.author.as_str()),
        ("FileDescription", layout.name.as_str()),
        ("FileVersion", version.as_str()),
        ("InternalName", stem),
        ("LegalCopyright", layout.copyright.as_str()),
        ("OriginalFilename", layout.dll_name.as_str()),
        ("ProductName", layout.name.as_str()),
        ("ProductVersion", version.as_str()),
    ]);

    let table = arena.blob(4)?;
    arena.append_u16(table, 0xFFFF)?; // wLength, patched below
    arena.append_u16(table, 0)?; // wValueLength (none)
    arena.append_u16(table, 1)?; // wType (text)
    append_wsz(arena, table, &format!("{:04}{:04X}", 0, CP_UTF16))?;
    arena.append_padding(table, 4)?;
    for (key, value) in strings {
        let string = arena.blob(4)?;
        arena.append_u16(string, 0xFFFF)?;
        // wValueLength counts words, terminator included
        arena.append_u16(string, u16_len(value.chars().count() + 1)?)?;
        arena.append_u16(string, 1)?;
        append_wsz(arena, string, key)?;
        arena.append_padding(string, 4)?;
        append_wsz(arena, string, value)?;
        finish_node(arena, string)?;
        arena.append_blob(table, string)?;
    }
    finish_node(arena, table)?;
    Ok(table)
}

fn version_info(arena: &mut Arena, layout: &Layout) -> Result<BlobId> {
    let version_ms = makelong(layout.version.1, layout.version.0);
    let fixed = VsFixedFileInfo {
        signature: VS_FFI_SIGNATURE,
        struct_version: VS_FFI_STRUCVERSION,
        file_version_ms: version_ms,
        file_version_ls: 0,
        product_version_ms: version_ms,
        product_version_ls: 0,
        file_flags_mask: 0x3F,
        file_flags: 0,
        file_os: VOS_NT_WINDOWS32,
        file_type: VFT_DLL,
        file_subtype: VFT2_DRV_KEYBOARD,
        file_date_ms: 0,
        file_date_ls: 0,
    };
    let fixed_size = core::mem::size_of::<VsFixedFileInfo>();
    let mut fixed_bytes = vec![0u8; fixed_size];
    fixed_bytes.pwrite_with(fixed, 0, scroll::LE)?;

    let string_table = version_string_table(arena, layout)?;
    let info_string = arena.blob(4)?;
    arena.append_u16(info_string, 0xFFFF)?;
    arena.append_u16(info_string, 0)?;
    arena.append_u16(info_string, 1)?;
    append_wsz(arena, info_string, "StringFileInfo")?;
    arena.append_padding(info_string, 4)?;
    arena.append_blob(info_string, string_table)?;
    finish_node(arena, info_string)?;

    let var = arena.blob(4)?;
    arena.append_u16(var, 0xFFFF)?;
    arena.append_u16(var, 4)?; // wValueLength in bytes (binary value)
    arena.append_u16(var, 0)?;
    append_wsz(arena, var, "Translation")?;
    arena.append_padding(var, 4)?;
    arena.append_u32(var, makelong(LANG_EN_US, CP_UTF16))?;
    finish_node(arena, var)?;

    let info_var = arena.blob(4)?;
    arena.append_u16(info_var, 0xFFFF)?;
    arena.append_u16(info_var, 0)?;
    arena.append_u16(info_var, 1)?;
    append_wsz(arena, info_var, "VarFileInfo")?;
    arena.append_padding(info_var, 4)?;
    arena.append_blob(info_var, var)?;
    finish_node(arena, info_var)?;

    let info = arena.blob(16)?;
    arena.append_u16(info, 0xFFFF)?;
    arena.append_u16(info, u16_len(fixed_size)?)?;
    arena.append_u16(info, 0)?;
    append_wsz(arena, info, "VS_VERSION_INFO")?;
    arena.append_padding(info, 4)?;
    arena.append_bytes(info, &fixed_bytes)?;
    arena.append_padding(info, 4)?;
    arena.append_blob(info, info_string)?;
    arena.append_blob(info, info_var)?;
    finish_node(arena, info)?;
    Ok(info)
}

/// Builds the `.rsrc` content: the directory tree followed by the
/// VS_VERSIONINFO bytes it points at.
pub fn compile(arena: &mut Arena, layout: &Layout) -> Result<BlobId> {
    let info = version_info(arena, layout)?;
    let entries = vec![(
        ResourceKey::Id(RT_VERSION),
        ResourceNode::Directory(vec![(
            ResourceKey::Id(1),
            ResourceNode::Directory(vec![(
                ResourceKey::Id(LANG_EN_US as u32),
                ResourceNode::Data {
                    blob: info,
                    codepage: 0,
                },
            )]),
        )]),
    )];
    let tree = build_tree(arena, &entries)?;
    let rsrc = arena.blob(16)?;
    arena.append_blob(rsrc, tree)?;
    arena.append_blob(rsrc, info)?;
    Ok(rsrc)
}

/// A parsed resource table: named entries first, then ID entries.
#[derive(Debug, Default)]
pub struct ResourceTable {
    /// Name rows in file order.
    pub names: Vec<(String, ResourceEntry)>,
    /// ID rows in file order.
    pub ids: Vec<(u32, ResourceEntry)>,
}

impl ResourceTable {
    /// Looks up an ID row.
    pub fn get_id(&self, id: u32) -> Option<&ResourceEntry> {
        self.ids
            .iter()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, entry)| entry)
    }
}

/// A parsed resource row target.
#[derive(Debug)]
pub enum ResourceEntry {
    /// A sub-table.
    Directory(ResourceTable),
    /// A data entry.
    Data(ResourceDataEntry),
}

const MAX_RESOURCE_DEPTH: usize = 8;

fn read_table(
    section: &[u8],
    offset: usize,
    depth: usize,
    warnings: &mut Vec<Warning>,
) -> Result<ResourceTable> {
    if depth > MAX_RESOURCE_DEPTH {
        return Err(Error::Malformed("resource tree nests too deep".into()));
    }
    let mut reader = BlobReader::at(section, offset);
    reader.read_or_warn_uint(4, 1, 0, "resource table Characteristics")?;
    reader.read_or_warn_uint(4, 1, 0, "resource table TimeDateStamp")?;
    reader.read_or_warn_uint(2, 1, 0, "resource table MajorVersion")?;
    reader.read_or_warn_uint(2, 1, 0, "resource table MinorVersion")?;
    let name_count = reader.read_u16()?;
    let id_count = reader.read_u16()?;

    let mut table = ResourceTable::default();
    let read_target = |reader: &mut BlobReader, warnings: &mut Vec<Warning>| -> Result<ResourceEntry> {
        let raw = reader.read_u32()?;
        let target = (raw & 0x7FFF_FFFF) as usize;
        if raw & 0x8000_0000 != 0 {
            Ok(ResourceEntry::Directory(read_table(
                section,
                target,
                depth + 1,
                warnings,
            )?))
        } else {
            Ok(ResourceEntry::Data(section.pread_with(target, scroll::LE)?))
        }
    };
    for _ in 0..name_count {
        let name_offset = (reader.read_u32()? & 0x7FFF_FFFF) as usize;
        let mut name_reader = BlobReader::at(section, name_offset);
        let length = name_reader.read_u16()? as usize;
        let name_bytes = name_reader.read_bytes(2 * length, 1)?;
        let name = utf16_bytes_to_string(name_bytes);
        let entry = read_target(&mut reader, warnings)?;
        table.names.push((name, entry));
    }
    for _ in 0..id_count {
        let id = reader.read_u32()?;
        let entry = read_target(&mut reader, warnings)?;
        table.ids.push((id, entry));
    }
    warnings.extend(reader.take_warnings());
    Ok(table)
}

/// One node of a parsed VS_VERSIONINFO tree.
#[derive(Debug)]
pub struct VersionNode {
    /// The node key ("VS_VERSION_INFO", "StringFileInfo", ...).
    pub key: String,
    /// The node value.
    pub value: VersionValue,
    /// Child nodes in file order.
    pub children: Vec<VersionNode>,
}

/// A version node's value.
#[derive(Debug)]
pub enum VersionValue {
    /// Text value (`wType` 1), terminator stripped.
    Text(String),
    /// Binary value (`wType` 0).
    Binary(Vec<u8>),
}

impl VersionNode {
    /// The first child with the given key.
    pub fn child(&self, key: &str) -> Option<&VersionNode> {
        self.children.iter().find(|child| child.key == key)
    }

    /// The node's text value, if it is text.
    pub fn text(&self) -> Option<&str> {
        match &self.value {
            VersionValue::Text(text) => Some(text),
            VersionValue::Binary(_) => None,
        }
    }
}

/// Reads one version node (and its subtree) at the reader's position.
pub fn read_version_node(reader: &mut BlobReader) -> Result<VersionNode> {
    reader.read_padding(4)?;
    let start = reader.offset;
    let length = reader.read_u16()? as usize;
    if length < 6 {
        return Err(Error::Malformed(format!(
            "version node of {} bytes cannot hold its own header",
            length
        )));
    }
    let end = start + length;
    let value_length = reader.read_u16()? as usize;
    let is_text = reader.read_u16()? == 1;
    let key = reader.read_wstr()?;
    reader.read_padding(4)?;
    let value = if is_text {
        let bytes = reader.read_bytes(2 * value_length, 1)?;
        VersionValue::Text(utf16_bytes_to_string(bytes))
    } else {
        VersionValue::Binary(reader.read_bytes(value_length, 1)?.to_vec())
    };
    let mut children = Vec::new();
    loop {
        // a node may end unaligned; the slack belongs to the parent
        let aligned = (reader.offset + 3) & !3;
        if aligned >= end {
            break;
        }
        reader.read_padding(4)?;
        children.push(read_version_node(reader)?);
    }
    if reader.offset < end {
        reader.offset = end;
    }
    debug!("version node {:?}: {} children", key, children.len());
    Ok(VersionNode {
        key,
        value,
        children,
    })
}

fn split_table_key(key: &str) -> Option<(u16, u16)> {
    if key.len() != 8 {
        return None;
    }
    let language = u16::from_str_radix(&key[0..4], 16).ok()?;
    let codepage = u16::from_str_radix(&key[4..8], 16).ok()?;
    Some((language, codepage))
}

/// Parses the resource directory and recovers the layout metadata from the
/// version resource. Missing pieces warn rather than fail.
pub fn parse(
    view: &ImageView,
    directory: (u32, u32),
    layout: &mut Layout,
    warnings: &mut Vec<Warning>,
) -> Result<()> {
    let (rva, size) = directory;
    let section = view.extract_fixed(rva, size as usize)?;
    let root = read_table(section, 0, 0, warnings)?;

    let info_entry = root
        .get_id(RT_VERSION)
        .and_then(|entry| match entry {
            ResourceEntry::Directory(table) => table.get_id(1),
            ResourceEntry::Data(_) => None,
        })
        .and_then(|entry| match entry {
            ResourceEntry::Directory(table) => table.get_id(LANG_EN_US as u32),
            ResourceEntry::Data(_) => None,
        });
    let data = match info_entry {
        Some(ResourceEntry::Data(data)) => *data,
        _ => {
            push_warning(warnings, Warning::MissingVersionInfo);
            return Ok(());
        }
    };

    let info_bytes = view.extract_fixed(data.offset_to_data, data.size as usize)?;
    let mut reader = BlobReader::new(info_bytes);
    let info = read_version_node(&mut reader)?;
    warnings.extend(reader.take_warnings());
    if info.key != "VS_VERSION_INFO" {
        push_warning(warnings, Warning::MissingVersionInfo);
        return Ok(());
    }

    if let VersionValue::Binary(fixed_bytes) = &info.value {
        if fixed_bytes.len() >= core::mem::size_of::<VsFixedFileInfo>() {
            let fixed: VsFixedFileInfo = fixed_bytes.pread_with(0, scroll::LE)?;
            if fixed.signature != VS_FFI_SIGNATURE {
                return Err(Error::BadMagic(fixed.signature as u64));
            }
            layout.version = (
                (fixed.file_version_ms >> 16) as u16,
                fixed.file_version_ms as u16,
            );
        }
    }

    let string_info = match info.child("StringFileInfo") {
        Some(node) => node,
        None => {
            push_warning(warnings, Warning::MissingVersionInfo);
            return Ok(());
        }
    };
    let mut used_table = false;
    for table in &string_info.children {
        let (language, codepage) = match split_table_key(&table.key) {
            Some(split) => split,
            None => continue,
        };
        if codepage != CP_UTF16 || used_table {
            push_warning(warnings, Warning::ExtraResourceLanguage(language));
            continue;
        }
        used_table = true;
        debug!("using version strings for language {:#x}", language);
        let get = |key: &str| {
            table
                .child(key)
                .and_then(VersionNode::text)
                .map(str::to_string)
        };
        if let Some(name) = get("FileDescription") {
            layout.name = name;
        }
        if let Some(author) = get("CompanyName") {
            layout.author = author;
        }
        if let Some(copyright) = get("LegalCopyright") {
            layout.copyright = copyright;
        }
        if let Some(dll_name) = get("OriginalFilename") {
            layout.dll_name = dll_name;
        }
    }
    if !used_table {
        push_warning(warnings, Warning::MissingVersionInfo);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_layout() -> Layout {
        Layout {
            name: "Test Layout".into(),
            author: "Example".into(),
            copyright: "(c) 2020".into(),
            version: (1, 3),
            dll_name: "kbdtst.dll".into(),
            ..Default::default()
        }
    }

    #[test]
    fn tree_rows_mark_subdirectories() {
        let mut arena = Arena::new();
        let leaf = arena.blob_with(b"\x01\x02\x03\x04", 4).unwrap();
        let entries = vec![(
            ResourceKey::Id(RT_VERSION),
            ResourceNode::Directory(vec![(
                ResourceKey::Id(1),
                ResourceNode::Data {
                    blob: leaf,
                    codepage: 0,
                },
            )]),
        )];
        let tree = build_tree(&mut arena, &entries).unwrap();
        let data = arena.data(tree);
        // root table: 12 zero bytes, 0 names, 1 id
        assert_eq!(&data[12..16], &[0, 0, 1, 0]);
        assert_eq!(&data[16..20], &RT_VERSION.to_le_bytes());
        let offset = u32::from_le_bytes([data[20], data[21], data[22], data[23]]);
        assert_ne!(offset & 0x8000_0000, 0, "sub-table offset needs the high bit");
        // every tree-local offset was resolved eagerly
        assert!(arena
            .symbols(tree)
            .values()
            .all(|symbol| !matches!(symbol.kind, SymbolKind::ResourceOffset { .. })));
        // the data entry still carries the image-global RVA symbol
        assert!(arena
            .symbols(tree)
            .values()
            .any(|symbol| matches!(symbol.kind, SymbolKind::Rva)));
    }

    #[test]
    fn named_entries_precede_and_sort() {
        let mut arena = Arena::new();
        let leaf_a = arena.blob_with(b"\xAA", 1).unwrap();
        let leaf_b = arena.blob_with(b"\xBB", 1).unwrap();
        let leaf_c = arena.blob_with(b"\xCC", 1).unwrap();
        let entries = vec![
            (ResourceKey::Id(3), ResourceNode::Data { blob: leaf_a, codepage: 0 }),
            (
                ResourceKey::Name("ZETA".into()),
                ResourceNode::Data { blob: leaf_b, codepage: 0 },
            ),
            (
                ResourceKey::Name("ALPHA".into()),
                ResourceNode::Data { blob: leaf_c, codepage: 0 },
            ),
        ];
        let tree = build_tree(&mut arena, &entries).unwrap();
        let data = arena.data(tree).to_vec();
        assert_eq!(&data[12..16], &[2, 0, 1, 0]);
        let mut warnings = Vec::new();
        let table = read_table(&data, 0, 0, &mut warnings).unwrap();
        assert_eq!(table.names[0].0, "ALPHA");
        assert_eq!(table.names[1].0, "ZETA");
        assert_eq!(table.ids[0].0, 3);
    }

    #[test]
    fn version_info_round_trips_through_the_node_parser() {
        let mut arena = Arena::new();
        let layout = sample_layout();
        let info = version_info(&mut arena, &layout).unwrap();
        let data = arena.data(info).to_vec();
        // wLength covers the whole node
        assert_eq!(u16::from_le_bytes([data[0], data[1]]) as usize, data.len());

        let mut reader = BlobReader::new(&data);
        let node = read_version_node(&mut reader).unwrap();
        assert_eq!(node.key, "VS_VERSION_INFO");
        let fixed: VsFixedFileInfo = match &node.value {
            VersionValue::Binary(bytes) => bytes.pread_with(0, scroll::LE).unwrap(),
            VersionValue::Text(_) => panic!("fixed info must be binary"),
        };
        assert_eq!(fixed.signature, VS_FFI_SIGNATURE);
        assert_eq!(fixed.file_version_ms, 0x0001_0003);
        assert_eq!(fixed.file_subtype, VFT2_DRV_KEYBOARD);

        let strings = node.child("StringFileInfo").unwrap();
        let table = &strings.children[0];
        assert_eq!(table.key, "000004B0");
        let keys: Vec<&str> = table.children.iter().map(|child| child.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "CompanyName",
                "FileDescription",
                "FileVersion",
                "InternalName",
                "LegalCopyright",
                "OriginalFilename",
                "ProductName",
                "ProductVersion",
            ]
        );
        assert_eq!(table.child("FileVersion").unwrap().text(), Some("1.3"));
        assert_eq!(table.child("InternalName").unwrap().text(), Some("kbdtst"));

        let var = node.child("VarFileInfo").unwrap().child("Translation").unwrap();
        match &var.value {
            VersionValue::Binary(bytes) => {
                assert_eq!(bytes.as_slice(), &[0x09, 0x04, 0xB0, 0x04]);
            }
            VersionValue::Text(_) => panic!("Translation must be binary"),
        }
    }
}
