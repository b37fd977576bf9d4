//! System capability checking.
//!
//! Verifies at runtime that the kernel supports everything the ptrace
//! monitor depends on. The check is performed once and cached in a static
//! `OnceLock`.
//!
//! ## Required Features
//!
//! | Feature | Minimum | Check Method |
//! |---------|---------|--------------|
//! | Kernel | 3.8 | `uname` (PTRACE_O_EXITKILL, seccomp RET_TRACE) |
//! | Seccomp | enabled | `prctl(PR_GET_SECCOMP)` |
//! | Yama | scope <= 1 | `/proc/sys/kernel/yama/ptrace_scope` |
//!
//! Yama scope 1 ("restricted") still permits tracing direct children, which
//! is all the monitor needs; scopes 2 and 3 do not.

use std::sync::OnceLock;

use rustix::system::uname;
use thiserror::Error;

use crate::seccomp;

/// Information about the system's tracing capabilities.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub kernel_version: (u32, u32, u32),
    pub seccomp_enabled: bool,
    /// Value of yama/ptrace_scope, or 0 when Yama is not built in.
    pub yama_ptrace_scope: u32,
}

/// Errors that can occur during system capability checking.
#[derive(Debug, Clone, Error)]
pub enum CheckError {
    #[error("kernel version {}.{}.{} is too old, need at least {}.{}.{}", .found.0, .found.1, .found.2, .required.0, .required.1, .required.2)]
    KernelTooOld {
        required: (u32, u32, u32),
        found: (u32, u32, u32),
    },

    #[error("seccomp is not available")]
    SeccompNotAvailable,

    #[error("yama ptrace_scope {0} forbids tracing child processes")]
    PtraceForbidden(u32),
}

const MIN_KERNEL: (u32, u32, u32) = (3, 8, 0);

static SYSTEM_CHECK: OnceLock<Result<SystemInfo, CheckError>> = OnceLock::new();

/// Runs the capability check, cached after the first call.
pub fn check() -> Result<SystemInfo, CheckError> {
    SYSTEM_CHECK.get_or_init(run_check).clone()
}

fn run_check() -> Result<SystemInfo, CheckError> {
    let kernel_version = kernel_version();
    if kernel_version < MIN_KERNEL {
        return Err(CheckError::KernelTooOld {
            required: MIN_KERNEL,
            found: kernel_version,
        });
    }

    let seccomp_enabled = seccomp::seccomp_available();
    if !seccomp_enabled {
        return Err(CheckError::SeccompNotAvailable);
    }

    let yama_ptrace_scope = yama_ptrace_scope();
    if yama_ptrace_scope > 1 {
        return Err(CheckError::PtraceForbidden(yama_ptrace_scope));
    }

    Ok(SystemInfo {
        kernel_version,
        seccomp_enabled,
        yama_ptrace_scope,
    })
}

fn kernel_version() -> (u32, u32, u32) {
    let uts = uname();
    let release = uts.release().to_string_lossy();
    parse_kernel_version(&release)
}

fn parse_kernel_version(release: &str) -> (u32, u32, u32) {
    let mut parts = release
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

fn yama_ptrace_scope() -> u32 {
    std::fs::read_to_string("/proc/sys/kernel/yama/ptrace_scope")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_release_strings() {
        assert_eq!(parse_kernel_version("6.1.0-18-amd64"), (6, 1, 0));
        assert_eq!(parse_kernel_version("5.15.153"), (5, 15, 153));
        assert_eq!(parse_kernel_version("4.4"), (4, 4, 0));
    }

    #[test]
    fn current_kernel_is_modern_enough() {
        assert!(kernel_version() >= MIN_KERNEL);
    }
}
