use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

/// Everything that can go wrong while loading and running an a.out image.
///
/// The format/architecture/flags and mapping-policy variants are diagnosed
/// before any tracee exists; the rest surface during the traced run.
#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "unsupported executable format: expected OMAGIC (0x107), NMAGIC (0x108), \
         ZMAGIC (0x10b) or QMAGIC (0xcc), got {0:#x}"
    )]
    UnsupportedFormat(u32),

    #[error("unsupported architecture: expected M_386 (0x64), got {0:#x}")]
    UnsupportedArchitecture(u32),

    #[error("unsupported flags: expected 0, got {0:#x}")]
    UnsupportedFlags(u32),

    #[error("cannot read image {}: {source}", path.display())]
    Image { path: PathBuf, source: io::Error },

    #[error("vm.mmap_min_addr = {policy:#x} prevents mapping at {required:#x}")]
    MappingPolicy { policy: u32, required: u32 },

    #[error("helper binary {} does not match the checkpoint table: {reason}", path.display())]
    TrampolineMismatch { path: PathBuf, reason: String },

    #[error("tracee made no instruction-pointer progress at {ip:#x} after {stalls} steps")]
    ProtocolViolation { ip: u64, stalls: u32 },

    #[error("tracee faulted with {signal}")]
    TraceeFault { signal: Signal },

    #[error("tracee exited with status {0} before the handshake finished")]
    EarlyExit(i32),

    #[error("scratch write of {0} bytes exceeds PATH_MAX")]
    ScratchTooLarge(usize),

    #[error("ptrace: {0}")]
    Errno(#[from] Errno),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
