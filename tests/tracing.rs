//! Integration tests that exercise the ptrace plumbing against real child
//! processes. Each child calls `traceme` before exec; the post-exec trap is
//! the first stop the tests see.

use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use aout86::mem;
use aout86::regs::ArchRegs;
use aout86::wait::{wait_for_syscall, SignalPolicy, SyscallOutcome};

fn spawn_stopped(mut cmd: Command) -> Pid {
    unsafe {
        cmd.pre_exec(|| {
            ptrace::traceme()?;
            Ok(())
        });
    }
    let child = cmd.spawn().expect("spawn traced child");
    let pid = Pid::from_raw(child.id() as i32);
    std::mem::forget(child);
    let status = waitpid(pid, None).expect("initial stop");
    assert!(
        matches!(status, WaitStatus::Stopped(_, Signal::SIGTRAP)),
        "expected the post-exec trap, got {status:?}"
    );
    ptrace::setoptions(
        pid,
        ptrace::Options::PTRACE_O_EXITKILL | ptrace::Options::PTRACE_O_TRACESYSGOOD,
    )
    .expect("set options");
    pid
}

fn kill_and_reap(pid: Pid) {
    ptrace::kill(pid).expect("kill tracee");
    waitpid(pid, None).expect("reap tracee");
}

#[test]
fn exit_before_target_syscall_reports_exited_once() {
    let mut cmd = Command::new("true");
    cmd.stdout(Stdio::null());
    let pid = spawn_stopped(cmd);

    // 0xfffe is not a syscall `true` will ever make
    match wait_for_syscall(pid, 0xfffe, &SignalPolicy::default()).expect("wait loop") {
        SyscallOutcome::Exited(code) => assert_eq!(code, 0),
        SyscallOutcome::Found(_) => panic!("found a syscall that does not exist"),
        SyscallOutcome::Signaled(signal) => panic!("unexpected signal death: {signal}"),
    }
    // the tracee is gone; any further tracing call must fail
    assert!(ptrace::getregs(pid).is_err());
}

#[test]
fn scratch_write_is_visible_at_the_returned_address() {
    let mut cmd = Command::new("sleep");
    cmd.arg("30").stdout(Stdio::null());
    let pid = spawn_stopped(cmd);

    let regs = ptrace::getregs(pid).expect("getregs");
    let payload = b"/opt/compat/libnew.so\0";
    let addr = mem::write_scratch(pid, regs.sp(), payload).expect("scratch write");
    assert_eq!(addr, regs.sp() - mem::SCRATCH_MARGIN);

    let back = mem::read_cstring(pid, addr, 256).expect("read back");
    assert_eq!(back, "/opt/compat/libnew.so");

    kill_and_reap(pid);
}

#[test]
fn read_bytes_appends_a_terminating_zero() {
    let mut cmd = Command::new("sleep");
    cmd.arg("30").stdout(Stdio::null());
    let pid = spawn_stopped(cmd);

    let regs = ptrace::getregs(pid).expect("getregs");
    let payload = [0x11u8, 0x22, 0x33, 0x44, 0x55];
    let addr = mem::write_scratch(pid, regs.sp(), &payload).expect("scratch write");

    let bytes = mem::read_bytes(pid, addr, payload.len()).expect("read");
    assert_eq!(bytes.len(), payload.len() + 1);
    assert_eq!(&bytes[..payload.len()], &payload);
    assert_eq!(bytes[payload.len()], 0);

    kill_and_reap(pid);
}

#[test]
fn oversized_scratch_write_is_rejected() {
    let mut cmd = Command::new("sleep");
    cmd.arg("30").stdout(Stdio::null());
    let pid = spawn_stopped(cmd);

    let regs = ptrace::getregs(pid).expect("getregs");
    let too_big = vec![0u8; libc::PATH_MAX as usize + 1];
    assert!(matches!(
        mem::write_scratch(pid, regs.sp(), &too_big),
        Err(aout86::Error::ScratchTooLarge(_))
    ));

    kill_and_reap(pid);
}
