//! aout86: runs legacy i386 a.out executables on kernels that no longer
//! load them natively.
//!
//! A privileged helper binary (the "trampoline") is exec'd under ptrace;
//! [`controller`] patches its registers and instruction stream at fixed
//! checkpoints so it maps one specific image, then emulates the legacy
//! `uselib` syscall for the running program's library loads.

pub mod aout;
pub mod controller;
pub mod diag;
pub mod error;
pub mod image;
pub mod mem;
pub mod regs;
pub mod trampoline;
pub mod uselib;
pub mod wait;

pub use error::{Error, Result};
