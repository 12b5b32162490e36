//! Architecture profiles.
//!
//! A keyboard DLL is built for one of three targets. The profile fixes
//! every architecture-dependent constant up front; nothing else in the
//! crate dispatches on the target.
//!
//! `Wow64` is the odd one out: 32-bit code (4-byte pointers, PE32) whose
//! keyboard tables use 8-byte long pointers, so that the 64-bit kernel can
//! consume them through the WoW64 layer.

use core::fmt;

/// COFF machine type for 32-bit x86.
pub const COFF_MACHINE_X86: u16 = 0x14C;
/// COFF machine type for x86-64.
pub const COFF_MACHINE_X86_64: u16 = 0x8664;

/// Optional-header magic for PE32.
pub const MAGIC_32: u16 = 0x10B;
/// Optional-header magic for PE32+.
pub const MAGIC_64: u16 = 0x20B;

/// A compilation target.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Arch {
    /// 32-bit x86.
    X86,
    /// 32-bit x86 image with 64-bit long pointers in the keyboard tables.
    Wow64,
    /// 64-bit x86-64.
    Amd64,
}

impl Arch {
    /// `sizeof(void *)` for the image itself.
    pub fn pointer(self) -> usize {
        match self {
            Arch::X86 | Arch::Wow64 => 4,
            Arch::Amd64 => 8,
        }
    }

    /// `sizeof(KBD_LONG_POINTER)`: the width of pointers inside the
    /// keyboard tables.
    pub fn long_pointer(self) -> usize {
        match self {
            Arch::X86 => 4,
            Arch::Wow64 | Arch::Amd64 => 8,
        }
    }

    /// Preferred image base.
    pub fn image_base(self) -> u64 {
        match self {
            Arch::X86 => 0x5FFF_0000,
            Arch::Wow64 => 0x5FFE_0000,
            Arch::Amd64 => 0x1_8000_0000,
        }
    }

    /// COFF `Machine` value.
    pub fn machine(self) -> u16 {
        match self {
            Arch::X86 | Arch::Wow64 => COFF_MACHINE_X86,
            Arch::Amd64 => COFF_MACHINE_X86_64,
        }
    }

    /// COFF `Characteristics` value.
    pub fn characteristics(self) -> u16 {
        match self {
            // executable | 32-bit word machine | dll
            Arch::X86 | Arch::Wow64 => 0x2102,
            // executable | large address aware | dll
            Arch::Amd64 => 0x2022,
        }
    }

    /// Optional-header magic.
    pub fn optional_magic(self) -> u16 {
        match self {
            Arch::X86 | Arch::Wow64 => MAGIC_32,
            Arch::Amd64 => MAGIC_64,
        }
    }

    /// Instruction bytes preceding the table address in the
    /// `KbdLayerDescriptor` thunk.
    pub fn thunk_prefix(self) -> &'static [u8] {
        match self {
            // MOV EAX, imm32
            Arch::X86 | Arch::Wow64 => &[0xB8],
            // MOV RAX, imm64
            Arch::Amd64 => &[0x48, 0xB8],
        }
    }

    /// Instruction bytes following the table address in the thunk.
    pub fn thunk_suffix(self) -> &'static [u8] {
        match self {
            // RET
            Arch::X86 | Arch::Amd64 => &[0xC3],
            // CDQ sign-extends EAX into EDX:EAX; RET
            Arch::Wow64 => &[0x99, 0xC3],
        }
    }

    /// Display name, used in the generator banner.
    pub fn name(self) -> &'static str {
        match self {
            Arch::X86 => "Windows-x86",
            Arch::Wow64 => "Windows-WoW64",
            Arch::Amd64 => "Windows-amd64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.name())
    }
}
