//! Register and memory dumpers. Best-effort: peek failures print as zero
//! words rather than aborting a dump that exists to explain an abort.

use libc::c_void;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, error};

use crate::mem;
use crate::regs::ArchRegs;

const WINDOW_WORDS: i64 = 16;

/// Full state dump on a fault signal: all general registers plus memory
/// windows around the instruction and stack pointers.
pub fn fault_dump(pid: Pid, signal: Signal) {
    error!(%signal, %pid, "tracee fault");
    let Ok(regs) = ptrace::getregs(pid) else {
        error!("registers unavailable");
        return;
    };
    for (name, value) in regs.dump() {
        error!("{name:>8}: {value:#010x}");
    }
    error!("dump at eip:{}", memory_window(pid, regs.ip()));
    error!("dump at esp:{}", memory_window(pid, regs.sp()));
}

/// Sixteen 32-bit words centered on `addr`, four per line.
pub fn memory_window(pid: Pid, addr: u64) -> String {
    let mut out = String::new();
    for i in -(WINDOW_WORDS / 2)..WINDOW_WORDS / 2 {
        let at = addr.wrapping_add_signed(i * 4);
        if i % 4 == 0 {
            out.push_str(&format!("\n{at:#010x}:"));
        }
        let value = ptrace::read(pid, at as *mut c_void).unwrap_or(0) as u32;
        out.push_str(&format!("\t{value:#010x}"));
    }
    out
}

/// Logs the NUL-terminated string at `addr` when debug logging is on.
pub fn peek_string(pid: Pid, addr: u64) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    match mem::read_cstring(pid, addr, 1024) {
        Ok(s) => debug!("data at {addr:#010x}: \"{s}\""),
        Err(err) => debug!("data at {addr:#010x} unreadable: {err}"),
    }
}
