//! The legacy a.out executable header and its four on-disk layouts.
//!
//! The header is a fixed 32-byte record of eight little-endian words, read
//! from byte offset 0 of the image. `a_info` packs the magic number (bits
//! 0-15), machine type (16-23) and flags (24-31); the remaining fields are
//! segment sizes and the entry point.

use std::fmt;
use std::io::{self, Read};

use crate::error::{Error, Result};

/// Code indicating an object file or impure executable.
pub const MAGIC_OMAGIC: u32 = 0o407;
/// Code indicating a pure executable.
pub const MAGIC_NMAGIC: u32 = 0o410;
/// Code indicating a demand-paged executable.
pub const MAGIC_ZMAGIC: u32 = 0o413;
/// Demand-paged executable with the header in the text. The first page is
/// left unmapped to trap NULL pointer references.
pub const MAGIC_QMAGIC: u32 = 0o314;

/// The only machine type we load.
pub const M_386: u32 = 100;

pub const HEADER_LEN: usize = 32;

/// The `struct exec` record at the start of every a.out image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exec {
    pub a_info: u32,
    pub a_text: u32,
    pub a_data: u32,
    pub a_bss: u32,
    pub a_syms: u32,
    pub a_entry: u32,
    pub a_trsize: u32,
    pub a_drsize: u32,
}

impl Exec {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            a_info: word(0),
            a_text: word(4),
            a_data: word(8),
            a_bss: word(12),
            a_syms: word(16),
            a_entry: word(20),
            a_trsize: word(24),
            a_drsize: word(28),
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut bytes = [0u8; HEADER_LEN];
        reader.read_exact(&mut bytes)?;
        Ok(Self::parse(&bytes))
    }

    pub fn magic(&self) -> u32 {
        self.a_info & 0xffff
    }

    pub fn machine(&self) -> u32 {
        (self.a_info >> 16) & 0xff
    }

    pub fn flags(&self) -> u32 {
        (self.a_info >> 24) & 0xff
    }

    /// Accepts or rejects the header: the magic must be one of the four
    /// known kinds, the machine type must be `M_386` and the flags must be
    /// zero. Rejection carries the offending value so the operator sees
    /// exactly which check failed.
    pub fn validate(&self) -> Result<MagicKind> {
        let kind =
            MagicKind::from_magic(self.magic()).ok_or(Error::UnsupportedFormat(self.magic()))?;
        if self.machine() != M_386 {
            return Err(Error::UnsupportedArchitecture(self.machine()));
        }
        if self.flags() != 0 {
            return Err(Error::UnsupportedFlags(self.flags()));
        }
        Ok(kind)
    }
}

impl fmt::Display for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "magic       : {:#x}", self.magic())?;
        writeln!(f, "machine     : {:#x}", self.machine())?;
        writeln!(f, "flags       : {:#x}", self.flags())?;
        writeln!(f, "sizeof(text): {0:#x} ({0})", self.a_text)?;
        writeln!(f, "sizeof(data): {0:#x} ({0})", self.a_data)?;
        writeln!(f, "sizeof(bss) : {0:#x} ({0})", self.a_bss)?;
        writeln!(f, "sizeof(syms): {0:#x} ({0})", self.a_syms)?;
        writeln!(f, "entry-point : {0:#x} ({0})", self.a_entry)?;
        writeln!(f, "sizeof(trel): {0:#x} ({0})", self.a_trsize)?;
        writeln!(f, "sizeof(drel): {0:#x} ({0})", self.a_drsize)
    }
}

/// Where the text segment sits in the on-disk image and where the data
/// segment must start in the normalized staging file (0 = directly after
/// text, no padding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub text_offset: u32,
    pub data_offset: u32,
}

/// The four on-disk layout variants an image header can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicKind {
    Omagic,
    Nmagic,
    Zmagic,
    Qmagic,
}

impl MagicKind {
    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            MAGIC_OMAGIC => Some(Self::Omagic),
            MAGIC_NMAGIC => Some(Self::Nmagic),
            MAGIC_ZMAGIC => Some(Self::Zmagic),
            MAGIC_QMAGIC => Some(Self::Qmagic),
            _ => None,
        }
    }

    /// Normalization parameters for this kind, or `None` for QMAGIC images,
    /// which are mapped from disk as-is.
    pub fn layout(self) -> Option<ImageLayout> {
        match self {
            // Skip the header; text and data are back to back.
            Self::Omagic => Some(ImageLayout { text_offset: 32, data_offset: 0 }),
            // Skip the header; pad so the data segment starts page-aligned.
            Self::Nmagic => Some(ImageLayout { text_offset: 32, data_offset: 0x1000 }),
            // Text begins after 1 KiB of padding; no gap before data.
            Self::Zmagic => Some(ImageLayout { text_offset: 0x400, data_offset: 0 }),
            Self::Qmagic => None,
        }
    }

    /// Lowest address the trampoline will map for this kind.
    pub fn min_mapping_addr(self) -> u32 {
        match self {
            Self::Qmagic => 0x1000,
            _ => 0,
        }
    }
}

/// Rounds a segment size up to the next whole page. Never rounds down.
pub fn aligned_segment_size(size: u32) -> u32 {
    let page = page_size();
    size.div_ceil(page) * page
}

pub fn page_size() -> u32 {
    // sysconf(_SC_PAGESIZE) cannot fail on Linux.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u32 }
}
