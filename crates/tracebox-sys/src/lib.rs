//! Low-level Linux syscall wrappers for the tracebox monitor.
//!
//! This crate provides thin wrappers around Linux-specific tracing syscalls
//! that are not available in rustix or are awkward through libc. For standard
//! syscalls, use rustix.
//!
//! ## Modules
//!
//! - **ptrace** - PTRACE_SEIZE and friends, register sets, raw waitpid
//! - **seccomp** - Seccomp-BPF filters whose default verdict is RET_TRACE
//! - **signal** - sigset construction and `sigtimedwait`
//! - **check** - Runtime system capability detection
//! - **unwind** - libunwind-ptrace FFI (feature `libunwind`)
//!
//! ## Seccomp-BPF
//!
//! The filters built here do not kill on unlisted syscalls. They return
//! `SECCOMP_RET_TRACE` with a 16-bit architecture tag in `SECCOMP_RET_DATA`,
//! stopping the task so the attached tracer can decide.
//!
//! # Safety
//!
//! This crate contains raw syscall wrappers. Casts between integer types
//! are unavoidable when interfacing with the kernel ABI.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod check;
pub mod ptrace;
pub mod seccomp;
pub mod signal;

#[cfg(feature = "libunwind")]
pub mod unwind;

pub use check::{check, CheckError, SystemInfo};

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}
