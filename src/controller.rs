//! Top-level orchestration: validate, normalize, spawn the traced helper,
//! drive the main-image handshake, then emulate `uselib` until the tracee
//! exits.

use std::ffi::{CString, OsString};
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, info};

use crate::aout::Exec;
use crate::diag;
use crate::error::{Error, Result};
use crate::image;
use crate::regs::ArchRegs;
use crate::trampoline::{self, MainPlan};
use crate::uselib::{LibraryMap, UselibEmulator};
use crate::wait::{self, classify, SignalPolicy, Stop, SyscallOutcome};

pub struct RunConfig {
    /// The a.out executable to load.
    pub program: PathBuf,
    /// Arguments forwarded to the legacy program unchanged.
    pub args: Vec<OsString>,
    /// The helper binary exec'd inside the tracee.
    pub trampoline: PathBuf,
    pub library_map: LibraryMap,
    pub stall_limit: u32,
    pub signal_policy: SignalPolicy,
}

/// Runs one legacy executable to completion. Returns the exit code the
/// controller should mirror: the tracee's own code on normal termination,
/// or 128 + signal number if it was killed.
pub fn run(cfg: RunConfig) -> Result<i32> {
    let mut source = File::open(&cfg.program).map_err(|source| Error::Image {
        path: cfg.program.clone(),
        source,
    })?;
    let header = Exec::read_from(&mut source).map_err(|source| Error::Image {
        path: cfg.program.clone(),
        source,
    })?;
    let kind = header.validate()?;
    debug!(?kind, entry = format_args!("{:#x}", header.a_entry), "image accepted");

    image::check_mapping_policy(kind.min_mapping_addr())?;

    let image = match kind.layout() {
        Some(layout) => image::normalize(&mut source, &header, layout)?,
        // QMAGIC images are mapped from disk as-is
        None => {
            source.seek(SeekFrom::Start(0))?;
            source
        }
    };
    image::clear_cloexec(&image)?;

    trampoline::TABLE.validate_helper(&cfg.trampoline)?;

    let pid = spawn_traced(&cfg)?;
    info!(%pid, "tracee spawned");

    // The legacy program owns the terminal from here on.
    detach_stdin()?;

    // First stop is the self-raised SIGSTOP.
    waitpid(pid, None)?;
    ptrace::setoptions(
        pid,
        ptrace::Options::PTRACE_O_EXITKILL | ptrace::Options::PTRACE_O_TRACESYSGOOD,
    )?;

    // Run the child up to its exec of the helper, then free-run into the
    // helper image; the post-exec trap leaves us at its first instruction.
    match wait::wait_for_syscall(pid, libc::SYS_execve as u64, &cfg.signal_policy)? {
        SyscallOutcome::Found(_) => {}
        SyscallOutcome::Exited(code) => return Err(Error::EarlyExit(code)),
        SyscallOutcome::Signaled(signal) => return Err(Error::TraceeFault { signal }),
    }
    ptrace::cont(pid, None)?;
    match classify(waitpid(pid, None)?) {
        Stop::Trap => {}
        Stop::Exited(code) => return Err(Error::EarlyExit(code)),
        Stop::Signal(signal) | Stop::Signaled(signal) => {
            diag::fault_dump(pid, signal);
            return Err(Error::TraceeFault { signal });
        }
        Stop::SyscallBoundary | Stop::Other => {}
    }

    let plan = MainPlan::new(&header, kind);
    trampoline::run_main_sequence(pid, image.as_raw_fd(), &plan, cfg.stall_limit, &cfg.signal_policy)?;
    info!(entry = format_args!("{:#x}", plan.entry), "legacy program dispatched");

    let emulator = UselibEmulator::new(&cfg.library_map, cfg.stall_limit, &cfg.signal_policy);
    loop {
        match wait::wait_for_syscall(pid, wait::I386_SYS_USELIB, &cfg.signal_policy)? {
            SyscallOutcome::Found(regs) => {
                let result = intercept_uselib(pid, &regs, &emulator)?;
                debug!(result, "uselib emulated");
            }
            SyscallOutcome::Exited(code) => {
                info!(code, "tracee exited");
                return Ok(code);
            }
            SyscallOutcome::Signaled(signal) => {
                info!(%signal, "tracee killed by signal");
                return Ok(128 + signal as i32);
            }
        }
    }
}

/// Forks the tracee. The child marks itself traced, stops so the parent can
/// attach its options before anything interesting happens, then execs the
/// helper with the legacy program's path as argv[0] and the remaining
/// arguments forwarded unchanged.
fn spawn_traced(cfg: &RunConfig) -> Result<Pid> {
    let helper = path_cstring(&cfg.trampoline)?;
    let mut argv = vec![path_cstring(&cfg.program)?];
    for arg in &cfg.args {
        argv.push(
            CString::new(arg.as_bytes())
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?,
        );
    }

    match unsafe { unistd::fork() }? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            // only async-signal-safe calls between fork and exec
            let _ = ptrace::traceme();
            let _ = signal::raise(Signal::SIGSTOP);
            let _ = unistd::execvp(&helper, &argv);
            unsafe { libc::_exit(127) }
        }
    }
}

fn path_cstring(path: &std::path::Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err).into())
}

/// The controller must not compete with the tracee for terminal input.
fn detach_stdin() -> Result<()> {
    let null = File::open("/dev/null")?;
    unistd::dup2(null.as_raw_fd(), libc::STDIN_FILENO)?;
    Ok(())
}

/// Intercept-before-entry: the pending syscall's number is replaced with an
/// invalid one so the kernel executes nothing, the exit stop is consumed,
/// and the emulated result is written into the return-value register. The
/// real `uselib` never runs, on success or failure.
fn intercept_uselib(
    pid: Pid,
    entry_regs: &libc::user_regs_struct,
    emulator: &UselibEmulator<'_>,
) -> Result<i32> {
    let mut cancel = *entry_regs;
    cancel.set_syscall_no(u64::MAX);
    ptrace::setregs(pid, cancel)?;
    ptrace::syscall(pid, None)?;
    match classify(waitpid(pid, None)?) {
        Stop::SyscallBoundary => {}
        Stop::Exited(code) => return Err(Error::EarlyExit(code)),
        Stop::Signal(signal) | Stop::Signaled(signal) => {
            diag::fault_dump(pid, signal);
            return Err(Error::TraceeFault { signal });
        }
        Stop::Trap | Stop::Other => {}
    }

    let result = emulator.emulate(pid, entry_regs)?;

    let mut restored = *entry_regs;
    restored.set_result(result as i64 as u64);
    ptrace::setregs(pid, restored)?;
    Ok(result)
}
