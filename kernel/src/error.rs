//! The three-way error taxonomy used at the syscall boundary. Internal
//! primitives (the allocator, `mappages`, the directory helpers) keep
//! panicking directly on invariant violations; `KernelError` only wraps
//! what a syscall handler needs to report back across the ABI or use to
//! decide whether to zombie the caller.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Bad fd, unknown path, invalid argument: the caller gets a negative
    /// return value and keeps running.
    UserRecoverable(i64),
    /// Unsatisfiable page fault outside stack growth/CoW, ELF load
    /// failure: the process is zombied, its parent (if waiting) is woken.
    ProcessFatal(&'static str),
    /// Allocator exhaustion, an out-of-range free, a directory overflow,
    /// or any other condition this kernel has no recovery path for.
    KernelFatal(&'static str),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::UserRecoverable(code) => write!(f, "user-recoverable error ({code})"),
            KernelError::ProcessFatal(msg) => write!(f, "process-fatal: {msg}"),
            KernelError::KernelFatal(msg) => write!(f, "kernel-fatal: {msg}"),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
