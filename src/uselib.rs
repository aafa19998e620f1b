//! Emulation of the legacy `uselib` syscall, plus the library-name mapping
//! store consulted for each request.
//!
//! The real kernel call never executes. The controller cancels the pending
//! syscall, this module resolves and validates the requested image, and the
//! trampoline's library routine performs the actual mapping; the result is
//! written back into the tracee's return-value register.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::Path;

use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::aout::{Exec, MagicKind};
use crate::error::Result;
use crate::mem;
use crate::regs::ArchRegs;
use crate::trampoline::{self, LibPlan};
use crate::wait::SignalPolicy;

/// Read-only base-filename → replacement-path table, loaded once at
/// startup from a `key:value`-per-line file.
#[derive(Debug, Default)]
pub struct LibraryMap {
    entries: HashMap<String, String>,
}

impl LibraryMap {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A missing file is an empty map, not an error.
    pub fn load(path: &Path) -> io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::empty()),
            Err(err) => Err(err),
        }
    }

    /// One colon-delimited mapping per line; `\r` is tolerated and
    /// malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                    entries.insert(key.to_string(), value.to_string());
                }
                _ => warn!(line, "ignoring malformed library mapping"),
            }
        }
        Self { entries }
    }

    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }
}

/// The part of `path` after the last `/`, skipping empty segments.
pub fn basename(path: &str) -> &str {
    path.split('/').filter(|seg| !seg.is_empty()).next_back().unwrap_or("")
}

pub struct UselibEmulator<'a> {
    map: &'a LibraryMap,
    stall_limit: u32,
    policy: &'a SignalPolicy,
}

impl<'a> UselibEmulator<'a> {
    pub fn new(map: &'a LibraryMap, stall_limit: u32, policy: &'a SignalPolicy) -> Self {
        Self { map, stall_limit, policy }
    }

    /// Emulates one intercepted `uselib` request. `entry_regs` are the
    /// registers captured at the syscall's entry stop; the filename pointer
    /// is in the first argument register.
    ///
    /// Returns the value to place in the tracee's return-value register:
    /// 0 or the trampoline's result on a mapped library, a negative errno
    /// otherwise. `Err` is reserved for controller-side failures that
    /// abort the whole run.
    pub fn emulate(&self, pid: Pid, entry_regs: &libc::user_regs_struct) -> Result<i32> {
        let mut path_addr = entry_regs.arg1();
        let mut path = match mem::read_cstring(pid, path_addr, libc::PATH_MAX as usize) {
            Ok(path) => path,
            Err(err) => {
                debug!(%err, "unreadable uselib filename pointer");
                return Ok(-libc::EFAULT);
            }
        };
        debug!(%path, "uselib requested");

        let name = basename(&path);
        if let Some(mapped) = self.map.lookup(name) {
            debug!(name, mapped, "library name remapped");
            let mut bytes = mapped.as_bytes().to_vec();
            bytes.push(0);
            path_addr = mem::write_scratch(pid, entry_regs.sp(), &bytes)?;
            path = mapped.to_string();
        }

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                debug!(%path, %err, "library not found or not accessible");
                return Ok(-libc::ENOENT);
            }
        };
        let header = match Exec::read_from(&mut file) {
            Ok(header) => header,
            Err(err) => {
                debug!(%path, %err, "library too short for a header");
                return Ok(-libc::ENOEXEC);
            }
        };
        match header.validate() {
            // only the unmapped-guard layout can be mapped on demand
            Ok(MagicKind::Qmagic) => {}
            Ok(kind) => {
                debug!(%path, ?kind, "library is not QMAGIC");
                return Ok(-libc::ENOEXEC);
            }
            Err(err) => {
                debug!(%path, %err, "library header rejected");
                return Ok(-libc::ENOEXEC);
            }
        }

        let plan = LibPlan::new(&header);
        trampoline::run_library_sequence(pid, &plan, path_addr as u32, self.stall_limit, self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_takes_the_last_segment() {
        assert_eq!(basename("/a/b/c.lib"), "c.lib");
        assert_eq!(basename("nodir"), "nodir");
        assert_eq!(basename("/lib//libold.so"), "libold.so");
        assert_eq!(basename("trailing/"), "trailing");
        assert_eq!(basename(""), "");
        assert_eq!(basename("///"), "");
    }

    #[test]
    fn lookup_hits_and_misses() {
        let map = LibraryMap::parse("libold.so:/opt/compat/libnew.so\nc.lib:/tmp/c.lib\n");
        assert_eq!(map.lookup("libold.so"), Some("/opt/compat/libnew.so"));
        assert_eq!(map.lookup("c.lib"), Some("/tmp/c.lib"));
        assert_eq!(map.lookup("libother.so"), None);
    }

    #[test]
    fn mapped_request_resolves_to_the_replacement_path() {
        let map = LibraryMap::parse("c.lib:/tmp/mapped/c.lib\n");
        let requested = "/a/b/c.lib";
        let resolved = map.lookup(basename(requested)).unwrap_or(requested);
        assert_eq!(resolved, "/tmp/mapped/c.lib");

        let untouched = "/a/b/other.lib";
        let resolved = map.lookup(basename(untouched)).unwrap_or(untouched);
        assert_eq!(resolved, untouched);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let map = LibraryMap::parse("good:/x\r\nno-delimiter\n:emptykey\nemptyvalue:\n\nalso:/y\n");
        assert_eq!(map.lookup("good"), Some("/x"));
        assert_eq!(map.lookup("also"), Some("/y"));
        assert_eq!(map.lookup("no-delimiter"), None);
        assert_eq!(map.lookup(""), None);
        assert_eq!(map.lookup("emptyvalue"), None);
    }
}
