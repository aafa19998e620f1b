//! The helper binary's checkpoint ABI and the two handshakes driven over it.
//!
//! The helper ("trampoline") is a fixed i386 executable linked at
//! [`TRAMPOLINE_BASE`]. The controller never free-runs it: it single-steps
//! the tracee and intervenes at known instruction-pointer values, supplying
//! the mapping parameters in registers or patching them into the
//! instruction stream. [`TABLE`] is the complete contract; it must be
//! revised together with the helper binary.

use std::fs::File;
use std::io::Read;
use std::os::fd::RawFd;
use std::path::Path;

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tracing::{debug, trace};

use crate::aout::{aligned_segment_size, Exec, MagicKind};
use crate::diag;
use crate::error::{Error, Result};
use crate::mem;
use crate::regs::ArchRegs;
use crate::wait::{classify, SignalPolicy, Stop};

/// Load address of the helper binary.
pub const TRAMPOLINE_BASE: u64 = 0xc000_0000;

/// Entry pages sit on 4 KiB boundaries regardless of the host page size;
/// the mask is part of the on-disk format, not a tunable.
const ENTRY_PAGE_MASK: u32 = 0xffff_f000;

/// Actions the controller takes at the main-sequence checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// The `call` that maps the text+data file: ebx = base address,
    /// ecx = combined size, edx = image file descriptor.
    MapSegments,
    /// The `call` that maps anonymous bss: ebx = base, ecx = size. Skipped
    /// by advancing eip past the call when no separate bss is needed.
    MapBss,
    /// The final `jmp eax`: eax = legacy entry point. Stepping stops here.
    Dispatch,
}

/// Offsets of the library sequence's five `mov` instructions whose 32-bit
/// immediate operands are patched before the walk. The operand begins one
/// byte after the opcode.
#[derive(Debug, Clone, Copy)]
pub struct LibPatchSites {
    pub path: u64,
    pub base: u64,
    pub size: u64,
    pub bss_base: u64,
    pub bss_size: u64,
}

/// The fixed instruction-pointer contract with the helper binary. All
/// offsets are relative to [`TRAMPOLINE_BASE`].
#[derive(Debug, Clone, Copy)]
pub struct CheckpointTable {
    pub base: u64,
    /// ELF entry of the helper; also the lower bound of the checkpoint
    /// window.
    pub entry: u64,
    /// Upper bound of the checkpoint window.
    pub window: u64,
    pub main: [(u64, Checkpoint); 3],
    /// Length of a rel32 `call`, for skipping one.
    pub call_len: u64,
    /// Start of the library-mapping routine.
    pub lib_entry: u64,
    /// The library mapping's result is in eax when eip reaches this.
    pub lib_result: u64,
    pub lib_patches: LibPatchSites,
}

pub const TABLE: CheckpointTable = CheckpointTable {
    base: TRAMPOLINE_BASE,
    entry: 0xe0,
    window: 0x1000,
    main: [
        (0x105, Checkpoint::MapSegments),
        (0x10a, Checkpoint::MapBss),
        (0x112, Checkpoint::Dispatch),
    ],
    call_len: 5,
    lib_entry: 0x0,
    lib_result: 0x60,
    lib_patches: LibPatchSites { path: 0x8, base: 0x19, size: 0x1e, bss_base: 0x2f, bss_size: 0x34 },
};

impl CheckpointTable {
    pub const fn addr(&self, offset: u64) -> u64 {
        self.base + offset
    }

    /// Looks up the action for an instruction-pointer value, if it is a
    /// main-sequence checkpoint inside the helper's code window.
    pub fn action_at(&self, ip: u64) -> Option<Checkpoint> {
        if ip < self.addr(self.entry) || ip > self.addr(self.window) {
            return None;
        }
        self.main
            .iter()
            .find(|(offset, _)| self.addr(*offset) == ip)
            .map(|(_, action)| *action)
    }

    /// Checks the helper binary on disk against this table before any
    /// process is spawned: it must be a fixed-address 32-bit i386 ELF whose
    /// entry point equals the table's entry checkpoint.
    pub fn validate_helper(&self, path: &Path) -> Result<()> {
        let mut file = File::open(path).map_err(|source| Error::Image {
            path: path.to_owned(),
            source,
        })?;
        let mut ehdr = [0u8; 52];
        file.read_exact(&mut ehdr)
            .map_err(|_| self.mismatch(path, "shorter than an ELF32 header".into()))?;

        if ehdr[..4] != [0x7f, b'E', b'L', b'F'] {
            return Err(self.mismatch(path, "not an ELF image".into()));
        }
        if ehdr[4] != 1 {
            return Err(self.mismatch(path, "not a 32-bit image".into()));
        }
        let e_type = u16::from_le_bytes([ehdr[16], ehdr[17]]);
        if e_type != 2 {
            return Err(self.mismatch(path, "not a fixed-address executable".into()));
        }
        let e_machine = u16::from_le_bytes([ehdr[18], ehdr[19]]);
        if e_machine != 3 {
            return Err(self.mismatch(path, format!("machine type {e_machine} is not EM_386")));
        }
        let e_entry = u32::from_le_bytes([ehdr[24], ehdr[25], ehdr[26], ehdr[27]]);
        let expected = self.addr(self.entry) as u32;
        if e_entry != expected {
            return Err(self.mismatch(
                path,
                format!("entry point {e_entry:#x} does not match expected {expected:#x}"),
            ));
        }
        Ok(())
    }

    fn mismatch(&self, path: &Path, reason: String) -> Error {
        Error::TrampolineMismatch { path: path.to_owned(), reason }
    }
}

/// Mapping parameters for the main executable, precomputed from its
/// header. Text and data are page-rounded separately before summing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainPlan {
    pub base: u32,
    pub image_len: u32,
    /// Base and length of the anonymous bss mapping; `None` means the bss
    /// call is skipped. Only QMAGIC images carry a separate bss region.
    pub bss: Option<(u32, u32)>,
    pub entry: u32,
}

impl MainPlan {
    pub fn new(header: &Exec, kind: MagicKind) -> Self {
        let base = header.a_entry & ENTRY_PAGE_MASK;
        let image_len = aligned_segment_size(header.a_text) + aligned_segment_size(header.a_data);
        let bss = if kind == MagicKind::Qmagic && header.a_bss > 0 {
            Some((base + image_len, aligned_segment_size(header.a_bss)))
        } else {
            None
        };
        Self { base, image_len, bss, entry: header.a_entry }
    }
}

/// Mapping parameters for a library image. Unlike the main sequence, the
/// combined size rounds the sum of text and data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibPlan {
    pub base: u32,
    pub image_len: u32,
    pub bss_base: u32,
    pub bss_len: u32,
}

impl LibPlan {
    pub fn new(header: &Exec) -> Self {
        let base = header.a_entry & ENTRY_PAGE_MASK;
        let image_len = aligned_segment_size(header.a_text + header.a_data);
        Self {
            base,
            image_len,
            bss_base: base + image_len,
            bss_len: aligned_segment_size(header.a_bss),
        }
    }
}

/// What one single-step of the tracee came back as.
enum StepOutcome {
    Stepped,
    Fault(Signal),
    Exited(i32),
}

/// Steps the tracee once. Signals are never delivered while stepping:
/// fault signals are reported, anything else is suppressed.
fn step_once(pid: Pid, policy: &SignalPolicy) -> Result<StepOutcome> {
    ptrace::step(pid, None)?;
    loop {
        match classify(waitpid(pid, None)?) {
            Stop::Trap | Stop::SyscallBoundary => return Ok(StepOutcome::Stepped),
            Stop::Signal(signal) if policy.is_fault(signal) => {
                return Ok(StepOutcome::Fault(signal))
            }
            Stop::Signal(signal) => {
                debug!(%signal, "suppressing signal during step");
                ptrace::step(pid, None)?;
            }
            Stop::Exited(code) => return Ok(StepOutcome::Exited(code)),
            Stop::Signaled(signal) => return Ok(StepOutcome::Fault(signal)),
            Stop::Other => ptrace::step(pid, None)?,
        }
    }
}

/// Guard against a tracee that steps without moving: a checkpoint-table
/// mismatch would otherwise spin here forever.
struct StallGuard {
    limit: u32,
    last_ip: Option<u64>,
    stalls: u32,
}

impl StallGuard {
    fn new(limit: u32) -> Self {
        Self { limit, last_ip: None, stalls: 0 }
    }

    fn observe(&mut self, ip: u64) -> Result<()> {
        if self.last_ip == Some(ip) {
            self.stalls += 1;
            if self.stalls >= self.limit {
                return Err(Error::ProtocolViolation { ip, stalls: self.stalls });
            }
        } else {
            self.stalls = 0;
            self.last_ip = Some(ip);
        }
        Ok(())
    }
}

/// Drives the helper from its post-exec trap to the final dispatch: supplies
/// the text+data mapping parameters, supplies or skips the bss mapping, and
/// loads the legacy entry point into the dispatch register. Returns with the
/// tracee stopped at the `jmp eax`; the next resume enters the legacy
/// program.
pub fn run_main_sequence(
    pid: Pid,
    image_fd: RawFd,
    plan: &MainPlan,
    stall_limit: u32,
    policy: &SignalPolicy,
) -> Result<()> {
    let mut guard = StallGuard::new(stall_limit);
    loop {
        let mut regs = ptrace::getregs(pid)?;
        let ip = regs.ip();
        trace!(ip = format_args!("{ip:#x}"), "main sequence step");

        match TABLE.action_at(ip) {
            Some(Checkpoint::MapSegments) => {
                debug!(
                    base = format_args!("{:#x}", plan.base),
                    len = format_args!("{:#x}", plan.image_len),
                    fd = image_fd,
                    "supplying segment mapping"
                );
                regs.set_arg1(plan.base as u64);
                regs.set_arg2(plan.image_len as u64);
                regs.set_arg3(image_fd as u64);
                ptrace::setregs(pid, regs)?;
            }
            Some(Checkpoint::MapBss) => {
                match plan.bss {
                    Some((base, len)) => {
                        debug!(
                            base = format_args!("{base:#x}"),
                            len = format_args!("{len:#x}"),
                            "supplying bss mapping"
                        );
                        regs.set_arg1(base as u64);
                        regs.set_arg2(len as u64);
                    }
                    None => {
                        debug!("skipping bss mapping");
                        regs.set_ip(ip + TABLE.call_len);
                    }
                }
                ptrace::setregs(pid, regs)?;
            }
            Some(Checkpoint::Dispatch) => {
                debug!(entry = format_args!("{:#x}", plan.entry), "dispatching to legacy entry");
                regs.set_result(plan.entry as u64);
                ptrace::setregs(pid, regs)?;
                return Ok(());
            }
            None => {}
        }

        guard.observe(ip)?;
        match step_once(pid, policy)? {
            StepOutcome::Stepped => {}
            StepOutcome::Fault(signal) => {
                diag::fault_dump(pid, signal);
                return Err(Error::TraceeFault { signal });
            }
            StepOutcome::Exited(code) => return Err(Error::EarlyExit(code)),
        }
    }
}

/// Re-enters the helper's library-mapping routine for one library image:
/// redirects eip to the routine, patches the path address and mapping
/// parameters into its instruction stream, then steps until the result
/// checkpoint and returns the mapping's result code.
///
/// A fault on this path aborts only this emulation, with a negative result;
/// the legacy program never sees the signal.
pub fn run_library_sequence(
    pid: Pid,
    plan: &LibPlan,
    path_addr: u32,
    stall_limit: u32,
    policy: &SignalPolicy,
) -> Result<i32> {
    let mut regs = ptrace::getregs(pid)?;
    regs.set_ip(TABLE.addr(TABLE.lib_entry));
    ptrace::setregs(pid, regs)?;

    let sites = TABLE.lib_patches;
    for (site, value) in [
        (sites.path, path_addr),
        (sites.base, plan.base),
        (sites.size, plan.image_len),
        (sites.bss_base, plan.bss_base),
        (sites.bss_size, plan.bss_len),
    ] {
        // the immediate operand starts one byte after the mov opcode
        mem::poke_u32(pid, TABLE.addr(site) + 1, value)?;
    }

    let mut guard = StallGuard::new(stall_limit);
    loop {
        let regs = ptrace::getregs(pid)?;
        let ip = regs.ip();
        trace!(ip = format_args!("{ip:#x}"), "library sequence step");
        if ip == TABLE.addr(TABLE.lib_result) {
            let result = regs.result() as u32 as i32;
            debug!(result, "library mapping finished");
            return Ok(result);
        }

        guard.observe(ip)?;
        match step_once(pid, policy)? {
            StepOutcome::Stepped => {}
            StepOutcome::Fault(signal) => {
                diag::fault_dump(pid, signal);
                return Ok(-libc::ENOEXEC);
            }
            StepOutcome::Exited(code) => return Err(Error::EarlyExit(code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aout::{MAGIC_QMAGIC, MAGIC_ZMAGIC, M_386};
    use std::io::Write;

    fn header(magic: u32, text: u32, data: u32, bss: u32, entry: u32) -> Exec {
        Exec {
            a_info: magic | (M_386 << 16),
            a_text: text,
            a_data: data,
            a_bss: bss,
            a_syms: 0,
            a_entry: entry,
            a_trsize: 0,
            a_drsize: 0,
        }
    }

    #[test]
    fn main_plan_rounds_text_and_data_separately() {
        let header = header(MAGIC_ZMAGIC, 0x1001, 0x0fff, 0, 0x1020);
        let plan = MainPlan::new(&header, MagicKind::Zmagic);
        assert_eq!(plan.base, 0x1000);
        assert_eq!(plan.image_len, 0x2000 + 0x1000);
        assert_eq!(plan.entry, 0x1020);
    }

    #[test]
    fn qmagic_with_bss_maps_it_after_the_image() {
        let header = header(MAGIC_QMAGIC, 0x1000, 0x1000, 0x123, 0x1020);
        let plan = MainPlan::new(&header, MagicKind::Qmagic);
        assert_eq!(plan.bss, Some((0x1000 + 0x2000, 0x1000)));
    }

    #[test]
    fn qmagic_without_bss_skips_the_bss_call() {
        let header = header(MAGIC_QMAGIC, 0x1000, 0x1000, 0, 0x1020);
        let plan = MainPlan::new(&header, MagicKind::Qmagic);
        assert_eq!(plan.bss, None);
        assert_eq!(plan.entry, 0x1020);
    }

    #[test]
    fn non_qmagic_never_maps_bss() {
        let header = header(MAGIC_ZMAGIC, 0x1000, 0x1000, 0x5000, 0x1020);
        let plan = MainPlan::new(&header, MagicKind::Zmagic);
        assert_eq!(plan.bss, None);
    }

    #[test]
    fn lib_plan_rounds_the_summed_image_size() {
        let header = header(MAGIC_QMAGIC, 0x800, 0x900, 0x10, 0x1020);
        let plan = LibPlan::new(&header);
        assert_eq!(plan.base, 0x1000);
        // 0x800 + 0x900 rounds to 0x2000 as a sum, not 0x1000 + 0x1000
        assert_eq!(plan.image_len, 0x2000);
        assert_eq!(plan.bss_base, 0x3000);
        assert_eq!(plan.bss_len, 0x1000);
    }

    #[test]
    fn action_lookup_respects_the_code_window() {
        assert_eq!(TABLE.action_at(TABLE.addr(0x105)), Some(Checkpoint::MapSegments));
        assert_eq!(TABLE.action_at(TABLE.addr(0x10a)), Some(Checkpoint::MapBss));
        assert_eq!(TABLE.action_at(TABLE.addr(0x112)), Some(Checkpoint::Dispatch));
        assert_eq!(TABLE.action_at(TABLE.addr(0x106)), None);
        // same offsets outside the helper's window mean nothing
        assert_eq!(TABLE.action_at(0x105), None);
    }

    fn helper_elf(class: u8, machine: u16, entry: u32) -> Vec<u8> {
        let mut ehdr = vec![0u8; 52];
        ehdr[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        ehdr[4] = class;
        ehdr[5] = 1; // little-endian
        ehdr[6] = 1; // EV_CURRENT
        ehdr[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        ehdr[18..20].copy_from_slice(&machine.to_le_bytes());
        ehdr[24..28].copy_from_slice(&entry.to_le_bytes());
        ehdr
    }

    #[test]
    fn helper_validation_accepts_a_matching_elf() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&helper_elf(1, 3, 0xc000_00e0)).unwrap();
        TABLE.validate_helper(file.path()).unwrap();
    }

    #[test]
    fn helper_validation_rejects_wrong_class_and_entry() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&helper_elf(2, 3, 0xc000_00e0)).unwrap();
        assert!(matches!(
            TABLE.validate_helper(file.path()),
            Err(Error::TrampolineMismatch { .. })
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&helper_elf(1, 3, 0xc000_0000)).unwrap();
        assert!(matches!(
            TABLE.validate_helper(file.path()),
            Err(Error::TrampolineMismatch { .. })
        ));
    }

    #[test]
    fn stall_guard_trips_at_the_limit() {
        let mut guard = StallGuard::new(2);
        guard.observe(0x10).unwrap();
        guard.observe(0x10).unwrap();
        assert!(matches!(
            guard.observe(0x10),
            Err(Error::ProtocolViolation { ip: 0x10, stalls: 2 })
        ));

        // progress resets the count
        let mut guard = StallGuard::new(2);
        guard.observe(0x10).unwrap();
        guard.observe(0x10).unwrap();
        guard.observe(0x14).unwrap();
        guard.observe(0x14).unwrap();
        guard.observe(0x14).unwrap_err();
    }
}
