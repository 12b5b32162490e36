//! Compile and decompile Windows keyboard-layout driver DLLs
//! (`KBD*.DLL`).
//!
//! Given a language-neutral [`Layout`] (scancode assignments, the
//! per-modifier character tables, dead-key compositions and metadata),
//! [`compile`] produces a byte-for-byte valid Portable Executable the
//! Windows kernel keyboard subsystem will load, for any of three targets:
//! 32-bit x86, AMD64, and the WoW64 variant (32-bit code with 64-bit
//! table pointers). [`decompile`] reads such a DLL back into a layout.
//!
//! ```
//! use kbdlink::{compile, Arch, Config, Layout};
//! use kbdlink::layout::{Character, KeyCode, ScanCode, ShiftState};
//!
//! let mut layout = Layout::default();
//! layout.name = "Example".to_string();
//! layout.dll_name = "kbdex.dll".to_string();
//! layout.keymap.insert(ScanCode::new(0x02), KeyCode::new(0x31));
//! layout
//!     .charmap
//!     .entry(0x31)
//!     .or_default()
//!     .insert(ShiftState::default(), Character::plain('1'));
//!
//! let dll = compile(&layout, Arch::Amd64, &Config::new(0)).unwrap();
//! assert_eq!(&dll.bytes[0..2], b"MZ");
//! ```
//!
//! The heavy lifting happens in two places: [`linker`], an arena of byte
//! blobs with alignment constraints and deferred symbols (pointers, RVAs,
//! sizes, resource offsets) that lays a reachable blob graph out into a
//! flat image; and [`pe`], which emits and parses the keyboard tables,
//! export directory, version resource, relocations and headers on top of
//! it.

pub mod arch;
pub mod error;
pub mod kbd;
pub mod layout;
pub mod linker;
pub mod pe;
pub mod wintypes;

pub use crate::arch::Arch;
pub use crate::error::{Error, Result, Warning};
pub use crate::layout::Layout;
pub use crate::pe::{compile, decompile, Compiled, Config, Decompiled};
