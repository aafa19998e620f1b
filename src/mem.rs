//! Byte-granular access to the tracee's address space, layered over the
//! word-sized ptrace peek/poke primitive.
//!
//! Every function here requires the tracee to be in a ptrace-stopped state;
//! the underlying calls fail with ESRCH otherwise.

use libc::c_long;
use nix::sys::ptrace::{self, AddressType};
use nix::unistd::Pid;

use crate::error::{Error, Result};

const WORD: usize = std::mem::size_of::<c_long>();

/// Scratch writes land this far below the tracee's stack pointer: a
/// 128-byte red zone plus PATH_MAX.
pub const SCRATCH_MARGIN: u64 = 128 + libc::PATH_MAX as u64;

/// Reads `len` bytes starting at `addr` and appends a terminating zero
/// byte, so the result is always `len + 1` bytes long. The callers are
/// string extraction and diagnostic dumps, which both want the guard byte.
pub fn read_bytes(pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len + 1);
    let mut off = 0usize;
    while off < len {
        let word = ptrace::read(pid, (addr + off as u64) as AddressType)?;
        let take = (len - off).min(WORD);
        out.extend_from_slice(&word.to_ne_bytes()[..take]);
        off += take;
    }
    out.push(0);
    Ok(out)
}

/// Reads a NUL-terminated string, stopping at the first zero byte or after
/// `max` bytes.
pub fn read_cstring(pid: Pid, addr: u64, max: usize) -> Result<String> {
    let mut bytes = Vec::new();
    let mut off = 0usize;
    'words: while off < max {
        let word = ptrace::read(pid, (addr + off as u64) as AddressType)?;
        for byte in word.to_ne_bytes() {
            if byte == 0 || bytes.len() == max {
                break 'words;
            }
            bytes.push(byte);
        }
        off += WORD;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Writes `data` to `addr`, word by word. A partial tail word is merged
/// with the existing memory so no byte past `data.len()` is clobbered.
pub fn write_bytes(pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
    let mut off = 0usize;
    while off < data.len() {
        let remaining = data.len() - off;
        let dst = (addr + off as u64) as AddressType;
        let word = if remaining >= WORD {
            let mut bytes = [0u8; WORD];
            bytes.copy_from_slice(&data[off..off + WORD]);
            c_long::from_ne_bytes(bytes)
        } else {
            let mut bytes = ptrace::read(pid, dst)?.to_ne_bytes();
            bytes[..remaining].copy_from_slice(&data[off..]);
            c_long::from_ne_bytes(bytes)
        };
        ptrace::write(pid, dst, word)?;
        off += remaining.min(WORD);
    }
    Ok(())
}

/// Patches a single 32-bit value in the tracee, e.g. the immediate operand
/// of a `mov` in the trampoline's instruction stream.
pub fn poke_u32(pid: Pid, addr: u64, value: u32) -> Result<()> {
    write_bytes(pid, addr, &value.to_le_bytes())
}

/// Places `data` in a scratch area below the tracee's live stack and
/// returns its address. `sp` must be the stack pointer fetched while the
/// tracee is stopped; the destination is only valid until the tracee is
/// resumed past the current syscall.
pub fn write_scratch(pid: Pid, sp: u64, data: &[u8]) -> Result<u64> {
    if data.len() > libc::PATH_MAX as usize {
        return Err(Error::ScratchTooLarge(data.len()));
    }
    let addr = sp - SCRATCH_MARGIN;
    write_bytes(pid, addr, data)?;
    Ok(addr)
}
