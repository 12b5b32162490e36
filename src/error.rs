//! Errors and structured warnings.
//!
//! Fatal conditions abort a compile or decompile with no partial output;
//! recoverable oddities become [`Warning`]s, which are collected alongside
//! the result and also emitted through the `log` facade so that callers
//! and tests can assert on them.

use core::fmt;
use core::result;

#[derive(Debug)]
/// A fatal compile or decompile error.
pub enum Error {
    /// The input layout is malformed (bad dll name, field out of range).
    Input(String),
    /// An integer does not fit the declared wire width.
    Overflow {
        /// The value that failed to narrow.
        value: u64,
        /// Target width in bytes.
        width: usize,
    },
    /// A string cannot be represented in the declared encoding.
    Unicode(String),
    /// The layout requires 15 or more distinct shift states.
    TooManyShiftStates(usize),
    /// A blob was mutated or re-appended after it had been placed.
    AlreadyPlaced,
    /// A blob was appended to itself, or a placement chain loops.
    CycleDetected,
    /// A requested alignment does not divide the blob's own alignment,
    /// or a parent cannot hold a child with stricter alignment.
    InvalidAlignment {
        /// Alignment asked for.
        requested: usize,
        /// Alignment the blob actually has.
        have: usize,
    },
    /// A read ran past the end of the input.
    EndOfInput {
        /// Offset the read started at.
        offset: usize,
        /// Number of bytes wanted.
        wanted: usize,
    },
    /// The bytes being decompiled are inconsistent in some way.
    Malformed(String),
    /// Invalid magic number.
    BadMagic(u64),
    /// Error propagated from the scroll codec.
    Scroll(scroll::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Scroll(err) => Some(err),
            _ => None,
        }
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Input(msg) => write!(fmt, "Invalid layout: {}", msg),
            Error::Overflow { value, width } => {
                write!(fmt, "Value {:#x} does not fit in {} bytes", value, width)
            }
            Error::Unicode(msg) => write!(fmt, "Unencodable string: {}", msg),
            Error::TooManyShiftStates(n) => {
                write!(fmt, "Too many shift states: {} >= 15", n)
            }
            Error::AlreadyPlaced => {
                write!(fmt, "Blob has already been placed into another blob")
            }
            Error::CycleDetected => write!(fmt, "Blob placement cycle detected"),
            Error::InvalidAlignment { requested, have } => write!(
                fmt,
                "Invalid alignment {} for blob with alignment {}",
                requested, have
            ),
            Error::EndOfInput { offset, wanted } => {
                write!(fmt, "Read of {} bytes at {:#x} past end of input", wanted, offset)
            }
            Error::Malformed(msg) => write!(fmt, "Malformed entity: {}", msg),
            Error::BadMagic(magic) => write!(fmt, "Invalid magic number: {:#x}", magic),
            Error::Scroll(err) => write!(fmt, "{}", err),
        }
    }
}

/// An alias for the result type used throughout the crate.
pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A recoverable oddity: the offending element is dropped or tolerated and
/// the operation continues.
pub enum Warning {
    /// A ligature character (WCH_LGTR) was found and skipped.
    LigatureSkipped,
    /// A composite virtual key with flag bits has no known plain form.
    UnknownSpecialVk(u16),
    /// A charmap entry has no scancode assigned to its virtual key.
    UnmappedVk(u16),
    /// More than 10 distinct shift states (the table still fits, barely).
    ManyShiftStates(usize),
    /// SGCAPS and dead keys in the base row are incompatible; the SGCAPS
    /// attribute was dropped.
    SgcapsDeadKeyConflict(u16),
    /// Two table rows map the same entity; the first one wins.
    DuplicateEntry(String),
    /// A dead-key row carries flags other than 0 or 1.
    UnknownDeadKeyFlags(u16),
    /// A dead-key row composes to a sentinel character.
    DeadKeyInvalidTarget(u32),
    /// Padding bytes that should be zero were not.
    NonZeroPadding {
        /// Offset of the first non-zero padding byte.
        offset: usize,
    },
    /// A field did not hold its customary value.
    UnexpectedValue {
        /// What was being read.
        context: &'static str,
        /// Value the field usually holds.
        expected: u64,
        /// Value actually found.
        found: u64,
    },
    /// The image prefers a different base address than the profile.
    NonPreferredBase {
        /// Base found in the optional header.
        found: u64,
        /// Base the architecture profile prefers.
        preferred: u64,
    },
    /// The optional header carries an unknown Subsystem value.
    UnknownSubsystem(u16),
    /// The optional header carries unknown DllCharacteristics bits.
    UnknownDllCharacteristics(u16),
    /// The image has no resource directory.
    MissingResourceDirectory,
    /// The resource directory has no usable version info.
    MissingVersionInfo,
    /// A version string table for an extra language was ignored.
    ExtraResourceLanguage(u16),
    /// The ligature table pointer is set; ligatures are not supported.
    LigatureTableIgnored,
}

impl fmt::Display for Warning {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Warning::LigatureSkipped => write!(fmt, "ligature detected, skipping"),
            Warning::UnknownSpecialVk(vk) => {
                write!(fmt, "unknown special vk, skipping: {:#x}", vk)
            }
            Warning::UnmappedVk(vk) => {
                write!(fmt, "vk {:#x} has characters but no scancode, skipping", vk)
            }
            Warning::ManyShiftStates(n) => write!(fmt, "many shift states: {} > 10", n),
            Warning::SgcapsDeadKeyConflict(vk) => write!(
                fmt,
                "SGCAPS is incompatible with dead keys in the base row of vk {:#x}, dropping it",
                vk
            ),
            Warning::DuplicateEntry(what) => write!(fmt, "duplicate {}, keeping the first", what),
            Warning::UnknownDeadKeyFlags(flags) => {
                write!(fmt, "unknown dead key flags: {:#x}", flags)
            }
            Warning::DeadKeyInvalidTarget(both) => {
                write!(fmt, "dead key {:#x} composes to a sentinel character", both)
            }
            Warning::NonZeroPadding { offset } => {
                write!(fmt, "non-zero padding at offset {:#x}", offset)
            }
            Warning::UnexpectedValue {
                context,
                expected,
                found,
            } => write!(
                fmt,
                "unexpected value for {}: {:#x} instead of {:#x}",
                context, found, expected
            ),
            Warning::NonPreferredBase { found, preferred } => write!(
                fmt,
                "image uses base {:#x} instead of preferred {:#x}",
                found, preferred
            ),
            Warning::UnknownSubsystem(value) => {
                write!(fmt, "unknown subsystem: {:#x}", value)
            }
            Warning::UnknownDllCharacteristics(value) => {
                write!(fmt, "unknown DllCharacteristics: {:#x}", value)
            }
            Warning::MissingResourceDirectory => write!(fmt, "no resource directory in image"),
            Warning::MissingVersionInfo => write!(fmt, "no version info in resource directory"),
            Warning::ExtraResourceLanguage(lang) => {
                write!(fmt, "ignoring version strings for extra language {:#x}", lang)
            }
            Warning::LigatureTableIgnored => {
                write!(fmt, "image carries a ligature table, ignoring it")
            }
        }
    }
}

/// Records a warning and forwards it to the `log` facade.
pub(crate) fn push_warning(sink: &mut Vec<Warning>, warning: Warning) {
    log::warn!("{}", warning);
    sink.push(warning);
}
