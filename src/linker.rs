//! The in-memory binary-object linker.
//!
//! A [`Blob`] is an owning byte buffer with an alignment constraint, a map
//! of unresolved [`Symbol`]s at fixed offsets, and at most one parent blob.
//! Blobs live in an [`Arena`] and are addressed by [`BlobId`], so that a
//! symbol can refer to its target without creating an ownership cycle;
//! cyclic pointer graphs between blobs are legal.
//!
//! [`Arena::link`] lays a reachable graph of blobs out into a single flat
//! container at a chosen base address, then resolves every symbol in place.
//! Blobs appear in the output in FIFO order of first reach, ties broken by
//! the order of the `roots` argument, with zero-filled padding between
//! them.

use std::collections::{BTreeMap, VecDeque};

use log::debug;
use scroll::ctx::{SizeWith, TryFromCtx};
use scroll::Pread;

use crate::error::{push_warning, Error, Result, Warning};

/// Index of a blob within its [`Arena`].
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
pub struct BlobId(usize);

/// Where a blob sits: inside `parent` at `offset`, or, for the container
/// a [`Arena::link`] call produced, at absolute offset `offset` with no
/// parent.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Placement {
    /// Enclosing blob, or `None` for a linked root container.
    pub parent: Option<BlobId>,
    /// Byte offset within the parent, or the base address of a root.
    pub offset: usize,
}

/// The closed set of deferred computations a blob may contain.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SymbolKind {
    /// An absolute pointer: `base` plus the target's resolved offset, or
    /// all zeros when the target is `None`.
    Pointer {
        /// Emitted width in bytes (4 or 8).
        width: usize,
        /// Image base added to the target's offset.
        base: u64,
    },
    /// A 4-byte relative virtual address: the target's resolved offset.
    Rva,
    /// The byte length of the target blob.
    Sizeof {
        /// Emitted width in bytes.
        width: usize,
    },
    /// A 4-byte offset within a resource tree; the high bit marks a
    /// sub-directory rather than a data entry.
    ResourceOffset {
        /// Whether the target is a sub-directory table.
        directory: bool,
    },
}

/// A deferred value at a fixed offset inside a blob.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Symbol {
    /// What to compute.
    pub kind: SymbolKind,
    /// The blob the computation refers to. `None` emits zeros (null
    /// pointer); required for `Sizeof` and `ResourceOffset`.
    pub target: Option<BlobId>,
}

impl Symbol {
    /// An absolute pointer of the given width.
    pub fn pointer(width: usize, base: u64, target: Option<BlobId>) -> Self {
        Symbol {
            kind: SymbolKind::Pointer { width, base },
            target,
        }
    }

    /// A relative virtual address.
    pub fn rva(target: BlobId) -> Self {
        Symbol {
            kind: SymbolKind::Rva,
            target: Some(target),
        }
    }

    /// The length of `target`, emitted as a `width`-byte integer.
    pub fn sizeof(width: usize, target: BlobId) -> Self {
        Symbol {
            kind: SymbolKind::Sizeof { width },
            target: Some(target),
        }
    }

    /// A resource-tree-relative offset.
    pub fn resource_offset(target: BlobId, directory: bool) -> Self {
        Symbol {
            kind: SymbolKind::ResourceOffset { directory },
            target: Some(target),
        }
    }

    /// Number of bytes this symbol occupies once emitted.
    pub fn size(&self) -> usize {
        match self.kind {
            SymbolKind::Pointer { width, .. } => width,
            SymbolKind::Rva => 4,
            SymbolKind::Sizeof { width } => width,
            SymbolKind::ResourceOffset { .. } => 4,
        }
    }
}

/// An owning byte buffer with alignment, unresolved symbols and an
/// optional placement inside a parent blob.
#[derive(Debug, Default)]
pub struct Blob {
    data: Vec<u8>,
    alignment: usize,
    symbols: BTreeMap<usize, Symbol>,
    placement: Option<Placement>,
}

/// Owns every blob of one compile or decompile; see the module docs.
#[derive(Debug, Default)]
pub struct Arena {
    blobs: Vec<Blob>,
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

impl Arena {
    /// An empty arena.
    pub fn new() -> Self {
        Arena::default()
    }

    /// Creates an empty blob with the given alignment.
    pub fn blob(&mut self, alignment: usize) -> Result<BlobId> {
        if alignment < 1 {
            return Err(Error::InvalidAlignment {
                requested: alignment,
                have: 1,
            });
        }
        self.blobs.push(Blob {
            data: Vec::new(),
            alignment,
            symbols: BTreeMap::new(),
            placement: None,
        });
        Ok(BlobId(self.blobs.len() - 1))
    }

    /// Creates a blob seeded with `data`.
    pub fn blob_with(&mut self, data: &[u8], alignment: usize) -> Result<BlobId> {
        let id = self.blob(alignment)?;
        self.blobs[id.0].data.extend_from_slice(data);
        Ok(id)
    }

    /// The blob's current bytes.
    pub fn data(&self, id: BlobId) -> &[u8] {
        &self.blobs[id.0].data
    }

    /// The blob's current length.
    pub fn len(&self, id: BlobId) -> usize {
        self.blobs[id.0].data.len()
    }

    /// The blob's alignment.
    pub fn alignment(&self, id: BlobId) -> usize {
        self.blobs[id.0].alignment
    }

    /// Overrides the blob's alignment (sections are re-aligned to the
    /// file alignment between the virtual and file layout passes).
    pub fn set_alignment(&mut self, id: BlobId, alignment: usize) -> Result<()> {
        if alignment < 1 {
            return Err(Error::InvalidAlignment {
                requested: alignment,
                have: self.blobs[id.0].alignment,
            });
        }
        self.blobs[id.0].alignment = alignment;
        Ok(())
    }

    /// The blob's unresolved (or, after a link, resolved) symbols by
    /// offset.
    pub fn symbols(&self, id: BlobId) -> &BTreeMap<usize, Symbol> {
        &self.blobs[id.0].symbols
    }

    /// Removes one symbol; used when a symbol has been resolved out of
    /// band (resource-tree offsets).
    pub fn remove_symbol(&mut self, id: BlobId, offset: usize) {
        self.blobs[id.0].symbols.remove(&offset);
    }

    /// The blob's direct placement, if any.
    pub fn placement(&self, id: BlobId) -> Option<Placement> {
        self.blobs[id.0].placement
    }

    /// Walks parent links to the top-most blob, summing offsets (including
    /// a root container's base). `None` if the blob is unplaced.
    pub fn find_placement(&self, id: BlobId) -> Result<Option<(BlobId, usize)>> {
        if self.blobs[id.0].placement.is_none() {
            return Ok(None);
        }
        let mut current = id;
        let mut total = 0usize;
        let mut steps = 0usize;
        loop {
            let placement = match self.blobs[current.0].placement {
                Some(placement) => placement,
                None => break,
            };
            total += placement.offset;
            match placement.parent {
                Some(parent) => current = parent,
                None => break,
            }
            steps += 1;
            if steps > self.blobs.len() {
                return Err(Error::CycleDetected);
            }
        }
        Ok(Some((current, total)))
    }

    /// The blob's resolved offset; fails if it has not been placed yet.
    pub fn offset_of(&self, id: BlobId) -> Result<usize> {
        match self.find_placement(id)? {
            Some((_, offset)) => Ok(offset),
            None => Err(Error::Malformed("blob has not been placed".into())),
        }
    }

    fn ensure_unplaced(&self, id: BlobId) -> Result<()> {
        if self.blobs[id.0].placement.is_some() {
            return Err(Error::AlreadyPlaced);
        }
        Ok(())
    }

    /// Grows the blob with zeros so its length becomes a multiple of
    /// `alignment`, which must divide the blob's own alignment.
    pub fn append_padding(&mut self, id: BlobId, alignment: usize) -> Result<()> {
        self.ensure_unplaced(id)?;
        let blob = &mut self.blobs[id.0];
        if alignment == 0 || blob.alignment % alignment != 0 {
            return Err(Error::InvalidAlignment {
                requested: alignment,
                have: blob.alignment,
            });
        }
        let pad = (alignment - blob.data.len() % alignment) % alignment;
        blob.data.resize(blob.data.len() + pad, 0);
        Ok(())
    }

    /// Appends raw bytes (alignment 1).
    pub fn append_bytes(&mut self, id: BlobId, bytes: &[u8]) -> Result<()> {
        self.ensure_unplaced(id)?;
        self.blobs[id.0].data.extend_from_slice(bytes);
        Ok(())
    }

    /// Appends a little-endian integer of `width` bytes, padding to the
    /// integer's natural alignment first.
    pub fn append_uint(&mut self, id: BlobId, value: u64, width: usize) -> Result<()> {
        self.append_padding(id, width)?;
        self.append_uint_packed(id, value, width)
    }

    /// Appends a little-endian integer with no alignment padding (the
    /// thunk immediate is packed into the instruction stream).
    pub fn append_uint_packed(&mut self, id: BlobId, value: u64, width: usize) -> Result<()> {
        self.ensure_unplaced(id)?;
        if width < 8 && value >> (width * 8) != 0 {
            return Err(Error::Overflow { value, width });
        }
        let bytes = value.to_le_bytes();
        self.blobs[id.0].data.extend_from_slice(&bytes[..width]);
        Ok(())
    }

    /// Appends a byte.
    pub fn append_u8(&mut self, id: BlobId, value: u8) -> Result<()> {
        self.append_uint(id, value as u64, 1)
    }

    /// Appends an aligned little-endian u16.
    pub fn append_u16(&mut self, id: BlobId, value: u16) -> Result<()> {
        self.append_uint(id, value as u64, 2)
    }

    /// Appends an aligned little-endian u32.
    pub fn append_u32(&mut self, id: BlobId, value: u32) -> Result<()> {
        self.append_uint(id, value as u64, 4)
    }

    /// Appends an aligned little-endian u64.
    pub fn append_u64(&mut self, id: BlobId, value: u64) -> Result<()> {
        self.append_uint(id, value, 8)
    }

    /// Overwrites bytes already appended; used to back-patch length
    /// prefixes in version-info nodes.
    pub fn patch_u16(&mut self, id: BlobId, offset: usize, value: u16) -> Result<()> {
        let blob = &mut self.blobs[id.0];
        if offset + 2 > blob.data.len() {
            return Err(Error::EndOfInput { offset, wanted: 2 });
        }
        blob.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Overwrites four bytes already appended; used when resource-tree
    /// offsets are resolved ahead of the section layout pass.
    pub fn patch_u32(&mut self, id: BlobId, offset: usize, value: u32) -> Result<()> {
        let blob = &mut self.blobs[id.0];
        if offset + 4 > blob.data.len() {
            return Err(Error::EndOfInput { offset, wanted: 4 });
        }
        blob.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Appends a symbol, padding to the symbol's emitted size first and
    /// reserving that many zero bytes for it.
    pub fn append_symbol(&mut self, id: BlobId, symbol: Symbol) -> Result<()> {
        self.append_padding(id, symbol.size())?;
        self.append_symbol_packed(id, symbol)
    }

    /// Appends a symbol with no alignment padding.
    pub fn append_symbol_packed(&mut self, id: BlobId, symbol: Symbol) -> Result<()> {
        self.ensure_unplaced(id)?;
        let blob = &mut self.blobs[id.0];
        let offset = blob.data.len();
        blob.symbols.insert(offset, symbol);
        blob.data.resize(offset + symbol.size(), 0);
        Ok(())
    }

    /// Nests `child` inside `parent` at the parent's next suitably aligned
    /// offset. The child's symbols are hoisted into the parent's map at
    /// shifted offsets (the child keeps its own copies).
    pub fn append_blob(&mut self, parent: BlobId, child: BlobId) -> Result<()> {
        if parent == child {
            return Err(Error::CycleDetected);
        }
        self.ensure_unplaced(parent)?;
        self.ensure_unplaced(child)?;
        let child_alignment = self.blobs[child.0].alignment;
        self.append_padding(parent, child_alignment)?;
        let offset = self.blobs[parent.0].data.len();
        self.blobs[child.0].placement = Some(Placement {
            parent: Some(parent),
            offset,
        });
        let (child_data, child_symbols) = {
            let child = &self.blobs[child.0];
            (child.data.clone(), child.symbols.clone())
        };
        let parent = &mut self.blobs[parent.0];
        parent.data.extend_from_slice(&child_data);
        for (symbol_offset, symbol) in child_symbols {
            parent.symbols.insert(offset + symbol_offset, symbol);
        }
        Ok(())
    }

    /// Appends `child` at the tail of an already-linked root container.
    ///
    /// Only the relocation directory uses this: its content is derived
    /// from the linked `.data` section, so it can only be produced after
    /// the section layout pass, and it must land inside the (empty,
    /// already placed) `.reloc` section.
    pub fn adopt(&mut self, parent: BlobId, child: BlobId) -> Result<()> {
        match self.blobs[parent.0].placement {
            Some(Placement { parent: None, .. }) => {}
            _ => return Err(Error::AlreadyPlaced),
        }
        self.ensure_unplaced(child)?;
        let child_alignment = self.blobs[child.0].alignment;
        let parent_blob = &self.blobs[parent.0];
        if parent_blob.alignment % child_alignment != 0 {
            return Err(Error::InvalidAlignment {
                requested: child_alignment,
                have: parent_blob.alignment,
            });
        }
        let mut offset = parent_blob.data.len();
        offset += (child_alignment - offset % child_alignment) % child_alignment;
        self.blobs[child.0].placement = Some(Placement {
            parent: Some(parent),
            offset,
        });
        let (child_data, child_symbols) = {
            let child = &self.blobs[child.0];
            (child.data.clone(), child.symbols.clone())
        };
        let parent_blob = &mut self.blobs[parent.0];
        parent_blob.data.resize(offset, 0);
        parent_blob.data.extend_from_slice(&child_data);
        for (symbol_offset, symbol) in child_symbols {
            parent_blob.symbols.insert(offset + symbol_offset, symbol);
        }
        Ok(())
    }

    fn top_of(&self, id: BlobId) -> Result<BlobId> {
        let mut current = id;
        let mut steps = 0usize;
        while let Some(Placement {
            parent: Some(parent),
            ..
        }) = self.blobs[current.0].placement
        {
            current = parent;
            steps += 1;
            if steps > self.blobs.len() {
                return Err(Error::CycleDetected);
            }
        }
        Ok(current)
    }

    /// Lays out every blob reachable from `roots` into a fresh container
    /// placed at `base`, then resolves all symbols in place.
    ///
    /// Reachability follows symbol targets transitively, breadth first.
    /// An already-placed blob is re-rooted to its top-most parent, which
    /// is enqueued instead; a previously linked root container re-entering
    /// here has its placement cleared and its (already resolved) symbols
    /// dropped, so no symbol is ever resolved twice.
    pub fn link(&mut self, roots: &[BlobId], base: usize) -> Result<BlobId> {
        let container = self.blob(1)?;
        let mut seen = vec![false; self.blobs.len()];
        let mut queue = VecDeque::new();
        for &root in roots {
            let top = self.top_of(root)?;
            if !seen[top.0] {
                seen[top.0] = true;
                queue.push_back(top);
            }
        }
        while let Some(id) = queue.pop_front() {
            if let Some(Placement { parent: None, .. }) = self.blobs[id.0].placement {
                self.blobs[id.0].placement = None;
                self.blobs[id.0].symbols.clear();
            }
            let alignment = lcm(
                self.blobs[container.0].alignment,
                self.blobs[id.0].alignment,
            );
            self.blobs[container.0].alignment = alignment;
            self.append_blob(container, id)?;
            let targets: Vec<BlobId> = self.blobs[id.0]
                .symbols
                .values()
                .filter_map(|symbol| symbol.target)
                .collect();
            for target in targets {
                let top = self.top_of(target)?;
                if !seen[top.0] {
                    seen[top.0] = true;
                    queue.push_back(top);
                }
            }
        }
        self.blobs[container.0].placement = Some(Placement {
            parent: None,
            offset: base,
        });
        debug!(
            "linked {} bytes at {:#x} (alignment {})",
            self.blobs[container.0].data.len(),
            base,
            self.blobs[container.0].alignment
        );
        let symbols: Vec<(usize, Symbol)> = self.blobs[container.0]
            .symbols
            .iter()
            .map(|(&offset, &symbol)| (offset, symbol))
            .collect();
        for (offset, symbol) in symbols {
            let value = self.resolve(&symbol)?;
            let width = symbol.size();
            if width < 8 && value >> (width * 8) != 0 {
                return Err(Error::Overflow { value, width });
            }
            let bytes = value.to_le_bytes();
            self.blobs[container.0].data[offset..offset + width].copy_from_slice(&bytes[..width]);
        }
        Ok(container)
    }

    /// Computes a symbol's value from its target's final placement.
    pub fn resolve(&self, symbol: &Symbol) -> Result<u64> {
        let target = match symbol.target {
            Some(target) => target,
            None => return Ok(0),
        };
        let offset = match self.find_placement(target)? {
            Some((_, offset)) => offset as u64,
            None => {
                return Err(Error::Malformed(
                    "symbol target has not been placed".into(),
                ))
            }
        };
        Ok(match symbol.kind {
            SymbolKind::Pointer { base, .. } => base + offset,
            SymbolKind::Rva => offset,
            SymbolKind::Sizeof { .. } => self.blobs[target.0].data.len() as u64,
            SymbolKind::ResourceOffset { directory } => {
                if directory {
                    offset | 0x8000_0000
                } else {
                    offset
                }
            }
        })
    }
}

/// A positioned cursor over a byte slice, with alignment-aware reads and
/// expected-value checks. Oddities (non-zero padding, off-nominal values)
/// are collected as warnings for the caller to drain.
#[derive(Debug)]
pub struct BlobReader<'a> {
    data: &'a [u8],
    /// Current read position.
    pub offset: usize,
    warnings: Vec<Warning>,
}

impl<'a> BlobReader<'a> {
    /// A reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        BlobReader {
            data,
            offset: 0,
            warnings: Vec::new(),
        }
    }

    /// A reader positioned at `offset`.
    pub fn at(data: &'a [u8], offset: usize) -> Self {
        BlobReader {
            data,
            offset,
            warnings: Vec::new(),
        }
    }

    /// Warnings collected so far; drained by the caller.
    pub fn take_warnings(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    /// Advances to the next multiple of `alignment`, warning if any
    /// skipped byte is non-zero.
    pub fn read_padding(&mut self, alignment: usize) -> Result<()> {
        let pad = (alignment - self.offset % alignment) % alignment;
        if self.offset + pad > self.data.len() {
            return Err(Error::EndOfInput {
                offset: self.offset,
                wanted: pad,
            });
        }
        if let Some(nonzero) = (self.offset..self.offset + pad).find(|&i| self.data[i] != 0) {
            push_warning(&mut self.warnings, Warning::NonZeroPadding { offset: nonzero });
        }
        self.offset += pad;
        Ok(())
    }

    /// Skips padding up to `alignment`, then returns the next `n` bytes.
    pub fn read_bytes(&mut self, n: usize, alignment: usize) -> Result<&'a [u8]> {
        self.read_padding(alignment)?;
        if self.offset + n > self.data.len() {
            return Err(Error::EndOfInput {
                offset: self.offset,
                wanted: n,
            });
        }
        let bytes = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(bytes)
    }

    /// Reads a little-endian unsigned integer of `width` bytes after
    /// skipping padding up to `alignment`.
    pub fn read_uint(&mut self, width: usize, alignment: usize) -> Result<u64> {
        let bytes = self.read_bytes(width, alignment)?;
        let mut buffer = [0u8; 8];
        buffer[..width].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buffer))
    }

    /// Reads a byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_uint(1, 1)? as u8)
    }

    /// Reads an aligned little-endian u16.
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_uint(2, 2)? as u16)
    }

    /// Reads an aligned little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_uint(4, 4)? as u32)
    }

    /// Reads an aligned little-endian u64.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_uint(8, 8)
    }

    /// Reads a scroll-derived struct with no alignment skipping.
    pub fn read_value<T>(&mut self) -> Result<T>
    where
        T: TryFromCtx<'a, scroll::Endian, Error = scroll::Error> + SizeWith<scroll::Endian>,
    {
        let size = T::size_with(&scroll::LE);
        if self.offset + size > self.data.len() {
            return Err(Error::EndOfInput {
                offset: self.offset,
                wanted: size,
            });
        }
        let data: &'a [u8] = self.data;
        let value = data.pread_with(self.offset, scroll::LE)?;
        self.offset += size;
        Ok(value)
    }

    /// Reads a null-terminated UTF-16LE string (terminator consumed, not
    /// returned).
    pub fn read_wstr(&mut self) -> Result<String> {
        let mut units = Vec::new();
        loop {
            let unit = self.read_u16()?;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        String::from_utf16(&units)
            .map_err(|_| Error::Unicode("invalid UTF-16 string in image".into()))
    }

    /// Reads `expected.len()` bytes and fails with `Malformed` unless they
    /// match.
    pub fn read_or_fail_bytes(&mut self, expected: &[u8], context: &'static str) -> Result<()> {
        let found = self.read_bytes(expected.len(), 1)?;
        if found != expected {
            return Err(Error::Malformed(format!(
                "unexpected bytes for {}: {:02x?} instead of {:02x?}",
                context, found, expected
            )));
        }
        Ok(())
    }

    /// Reads an integer and fails with `Malformed` unless it matches.
    pub fn read_or_fail_uint(
        &mut self,
        width: usize,
        alignment: usize,
        expected: u64,
        context: &'static str,
    ) -> Result<()> {
        let found = self.read_uint(width, alignment)?;
        if found != expected {
            return Err(Error::Malformed(format!(
                "unexpected value for {}: {:#x} instead of {:#x}",
                context, found, expected
            )));
        }
        Ok(())
    }

    /// Reads an integer, warning (but continuing) if it does not match.
    /// Returns the value actually read.
    pub fn read_or_warn_uint(
        &mut self,
        width: usize,
        alignment: usize,
        expected: u64,
        context: &'static str,
    ) -> Result<u64> {
        let found = self.read_uint(width, alignment)?;
        if found != expected {
            push_warning(
                &mut self.warnings,
                Warning::UnexpectedValue {
                    context,
                    expected,
                    found,
                },
            );
        }
        Ok(found)
    }
}
