//! Stop classification and the syscall wait loop.
//!
//! [`wait_for_syscall`] is the only place the tracee is resumed in "until
//! the next syscall boundary" increments; the trampoline handshakes
//! single-step instead.

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, trace};

use crate::diag;
use crate::error::{Error, Result};
use crate::regs::ArchRegs;

/// i386 syscall numbers the tracee uses after the helper has exec'd.
pub const I386_SYS_EXIT: u64 = 1;
pub const I386_SYS_USELIB: u64 = 86;

/// One classified stop of the tracee.
#[derive(Debug, Clone, Copy)]
pub enum Stop {
    /// Syscall-boundary stop (tagged by PTRACE_O_TRACESYSGOOD).
    SyscallBoundary,
    /// Plain SIGTRAP: a single-step stop or the post-exec trap.
    Trap,
    /// Stopped by some other signal.
    Signal(Signal),
    Exited(i32),
    Signaled(Signal),
    /// Ptrace events we do not subscribe to.
    Other,
}

pub fn classify(status: WaitStatus) -> Stop {
    match status {
        WaitStatus::PtraceSyscall(_) => Stop::SyscallBoundary,
        WaitStatus::Stopped(_, Signal::SIGTRAP) => Stop::Trap,
        WaitStatus::Stopped(_, signal) => Stop::Signal(signal),
        WaitStatus::Exited(_, code) => Stop::Exited(code),
        WaitStatus::Signaled(_, signal, _) => Stop::Signaled(signal),
        _ => Stop::Other,
    }
}

/// What to do with a signal that stops the tracee while we wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Deliver the signal when the tracee is resumed.
    Forward,
    /// Dump state and abort the run.
    Fault,
    /// Resume without delivering.
    Suppress,
}

/// Policy table keyed by signal number. The default forwards SIGALRM
/// (legacy programs rely on periodic timer delivery) and escalates the
/// hardware fault signals; everything else is suppressed.
#[derive(Debug, Clone)]
pub struct SignalPolicy {
    forward: Vec<Signal>,
    fault: Vec<Signal>,
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self {
            forward: vec![Signal::SIGALRM],
            fault: vec![Signal::SIGSEGV, Signal::SIGILL, Signal::SIGBUS, Signal::SIGFPE],
        }
    }
}

impl SignalPolicy {
    pub fn disposition(&self, signal: Signal) -> Disposition {
        if self.fault.contains(&signal) {
            Disposition::Fault
        } else if self.forward.contains(&signal) {
            Disposition::Forward
        } else {
            Disposition::Suppress
        }
    }

    pub fn is_fault(&self, signal: Signal) -> bool {
        self.disposition(signal) == Disposition::Fault
    }
}

/// How a [`wait_for_syscall`] call ended.
pub enum SyscallOutcome {
    /// The tracee is stopped at the entry of the requested syscall; the
    /// call has not executed yet. Carries the registers at the stop.
    Found(libc::user_regs_struct),
    Exited(i32),
    Signaled(Signal),
}

/// Resumes the tracee until it enters the kernel for syscall `target`,
/// forwarding or suppressing intervening signals per `policy`. Fault
/// signals abort the run with a register and memory dump.
pub fn wait_for_syscall(pid: Pid, target: u64, policy: &SignalPolicy) -> Result<SyscallOutcome> {
    let mut pending: Option<Signal> = None;
    loop {
        ptrace::syscall(pid, pending.take())?;
        match classify(waitpid(pid, None)?) {
            Stop::SyscallBoundary => {
                let regs = ptrace::getregs(pid)?;
                let no = regs.syscall_no();
                trace!(syscall = no, "syscall stop");
                if no == target && at_entry(&regs) {
                    debug!(syscall = no, eax = format_args!("{:#x}", regs.result()), "target syscall entered");
                    diag::peek_string(pid, regs.arg1());
                    return Ok(SyscallOutcome::Found(regs));
                }
                if no == I386_SYS_EXIT {
                    debug!("tracee entering exit");
                }
            }
            Stop::Trap | Stop::Other => {}
            Stop::Signal(signal) => match policy.disposition(signal) {
                Disposition::Forward => {
                    debug!(%signal, "forwarding signal");
                    pending = Some(signal);
                }
                Disposition::Fault => {
                    diag::fault_dump(pid, signal);
                    return Err(Error::TraceeFault { signal });
                }
                Disposition::Suppress => {
                    debug!(%signal, "suppressing signal");
                }
            },
            Stop::Exited(code) => return Ok(SyscallOutcome::Exited(code)),
            Stop::Signaled(signal) => return Ok(SyscallOutcome::Signaled(signal)),
        }
    }
}

/// At syscall entry the kernel has set the result register to -ENOSYS;
/// this tells entry stops apart from the exit stops of other calls with
/// the same number.
fn at_entry(regs: &libc::user_regs_struct) -> bool {
    regs.result() as u32 as i32 == -libc::ENOSYS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_forwards_alarm_and_escalates_faults() {
        let policy = SignalPolicy::default();
        assert_eq!(policy.disposition(Signal::SIGALRM), Disposition::Forward);
        assert_eq!(policy.disposition(Signal::SIGSEGV), Disposition::Fault);
        assert_eq!(policy.disposition(Signal::SIGILL), Disposition::Fault);
        assert_eq!(policy.disposition(Signal::SIGUSR1), Disposition::Suppress);
        assert_eq!(policy.disposition(Signal::SIGWINCH), Disposition::Suppress);
    }
}
