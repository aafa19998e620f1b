//! Arch-independent view of the tracee's register window.
//!
//! The tracee executes i386 code once the helper has exec'd, so the
//! interesting registers are eax/ebx/ecx/edx plus eip/esp/orig_eax. A
//! 64-bit controller sees those in the low halves of the 64-bit register
//! set (the kernel presents compat tracees through the same
//! `user_regs_struct`); a 32-bit controller sees them directly.

pub trait ArchRegs {
    fn ip(&self) -> u64;
    fn set_ip(&mut self, ip: u64);
    fn sp(&self) -> u64;
    /// The syscall number pending at a syscall-boundary stop (orig_eax).
    fn syscall_no(&self) -> u64;
    fn set_syscall_no(&mut self, no: u64);
    /// eax: the syscall return value, and the dispatch register of the
    /// trampoline's final `jmp eax`.
    fn result(&self) -> u64;
    fn set_result(&mut self, value: u64);
    /// ebx: first syscall argument, and the trampoline's base-address
    /// parameter.
    fn arg1(&self) -> u64;
    fn set_arg1(&mut self, value: u64);
    /// ecx: the trampoline's size parameter.
    fn set_arg2(&mut self, value: u64);
    /// edx: the trampoline's file-descriptor parameter.
    fn set_arg3(&mut self, value: u64);
    /// All general registers, for diagnostic dumps.
    fn dump(&self) -> [(&'static str, u64); 10];
}

#[cfg(target_arch = "x86_64")]
impl ArchRegs for libc::user_regs_struct {
    fn ip(&self) -> u64 {
        self.rip
    }
    fn set_ip(&mut self, ip: u64) {
        self.rip = ip;
    }
    fn sp(&self) -> u64 {
        self.rsp
    }
    fn syscall_no(&self) -> u64 {
        self.orig_rax
    }
    fn set_syscall_no(&mut self, no: u64) {
        self.orig_rax = no;
    }
    fn result(&self) -> u64 {
        self.rax
    }
    fn set_result(&mut self, value: u64) {
        self.rax = value;
    }
    fn arg1(&self) -> u64 {
        self.rbx
    }
    fn set_arg1(&mut self, value: u64) {
        self.rbx = value;
    }
    fn set_arg2(&mut self, value: u64) {
        self.rcx = value;
    }
    fn set_arg3(&mut self, value: u64) {
        self.rdx = value;
    }
    fn dump(&self) -> [(&'static str, u64); 10] {
        [
            ("eax", self.rax),
            ("orig_eax", self.orig_rax),
            ("ebx", self.rbx),
            ("ecx", self.rcx),
            ("edx", self.rdx),
            ("esi", self.rsi),
            ("edi", self.rdi),
            ("ebp", self.rbp),
            ("eip", self.rip),
            ("esp", self.rsp),
        ]
    }
}

#[cfg(target_arch = "x86")]
impl ArchRegs for libc::user_regs_struct {
    fn ip(&self) -> u64 {
        self.eip as u32 as u64
    }
    fn set_ip(&mut self, ip: u64) {
        self.eip = ip as _;
    }
    fn sp(&self) -> u64 {
        self.esp as u32 as u64
    }
    fn syscall_no(&self) -> u64 {
        self.orig_eax as u32 as u64
    }
    fn set_syscall_no(&mut self, no: u64) {
        self.orig_eax = no as _;
    }
    fn result(&self) -> u64 {
        self.eax as u32 as u64
    }
    fn set_result(&mut self, value: u64) {
        self.eax = value as _;
    }
    fn arg1(&self) -> u64 {
        self.ebx as u32 as u64
    }
    fn set_arg1(&mut self, value: u64) {
        self.ebx = value as _;
    }
    fn set_arg2(&mut self, value: u64) {
        self.ecx = value as _;
    }
    fn set_arg3(&mut self, value: u64) {
        self.edx = value as _;
    }
    fn dump(&self) -> [(&'static str, u64); 10] {
        [
            ("eax", self.eax as u32 as u64),
            ("orig_eax", self.orig_eax as u32 as u64),
            ("ebx", self.ebx as u32 as u64),
            ("ecx", self.ecx as u32 as u64),
            ("edx", self.edx as u32 as u64),
            ("esi", self.esi as u32 as u64),
            ("edi", self.edi as u32 as u64),
            ("ebp", self.ebp as u32 as u64),
            ("eip", self.eip as u32 as u64),
            ("esp", self.esp as u32 as u64),
        ]
    }
}
