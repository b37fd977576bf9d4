//! The terminal outcome of a sandboxed run.
//!
//! A `SandboxResult` is written exactly once: the first terminal status
//! wins, every later attempt is dropped. This is what makes concurrent
//! causes (timeout vs. external kill vs. the process simply dying) resolve
//! deterministically - the monitor decides the attribution order, the result
//! enforces single assignment.

use std::fmt;

use crate::regs::Regs;
use crate::syscall::Syscall;

/// Why a setup step failed before the sandboxee was fully monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupFailure {
    Signals,
    Ptrace,
    Subprocess,
    Notify,
    Policy,
    Wait,
    Limits,
    /// The sandboxee exited before the monitor ever saw its execve.
    Monitor,
}

/// Why the monitor loop aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorFailure {
    /// Register fetch failed for a live process.
    Fetch,
    /// Syscalls-in-progress bookkeeping went inconsistent.
    Inspect,
    /// waitpid reported ECHILD before the main process exit was seen.
    Child,
    Kill,
    Interrupt,
    GetEvent,
}

/// What the sandboxee did to get itself killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// A syscall the policy traced and the notify handler denied.
    Syscall(u64),
    /// A syscall issued under a non-host ABI.
    ArchSwitch(u64),
    /// The network proxy reported a disallowed connection.
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalStatus {
    #[default]
    Unset,
    /// Normal exit with the given exit code.
    Ok(i32),
    /// Killed by a signal that nobody asked for.
    Signaled(i32),
    /// The wall-clock deadline fired.
    Timeout,
    /// `kill()` was requested from outside.
    ExternalKill,
    Violation(Violation),
    SetupError(SetupFailure),
    InternalError(MonitorFailure),
}

impl FinalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FinalStatus::Unset)
    }
}

/// Monitor-thread resource usage, captured when the loop ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorRusage {
    pub user_time_us: u64,
    pub system_time_us: u64,
    pub max_rss_kb: u64,
}

#[derive(Debug, Default, Clone)]
pub struct SandboxResult {
    final_status: FinalStatus,
    regs: Option<Box<Regs>>,
    syscall: Option<Syscall>,
    proc_maps: Option<String>,
    stack_trace: Vec<String>,
    prog_name: String,
    network_violation: Option<String>,
    rusage_monitor: Option<MonitorRusage>,
}

impl SandboxResult {
    /// Records the terminal status. Only the first non-Unset write sticks.
    pub fn set_final_status(&mut self, status: FinalStatus) {
        if self.final_status == FinalStatus::Unset {
            self.final_status = status;
        }
    }

    pub fn final_status(&self) -> FinalStatus {
        self.final_status
    }

    /// The numeric reason attached to the status: exit code, signal number,
    /// syscall number, or an enumerated sub-reason.
    pub fn reason_code(&self) -> i64 {
        match self.final_status {
            FinalStatus::Unset => 0,
            FinalStatus::Ok(code) => i64::from(code),
            FinalStatus::Signaled(sig) => i64::from(sig),
            FinalStatus::Timeout | FinalStatus::ExternalKill => 0,
            FinalStatus::Violation(Violation::Syscall(nr))
            | FinalStatus::Violation(Violation::ArchSwitch(nr)) => nr as i64,
            FinalStatus::Violation(Violation::Network) => -1,
            FinalStatus::SetupError(sub) => sub as i64,
            FinalStatus::InternalError(sub) => sub as i64,
        }
    }

    pub fn set_regs(&mut self, regs: Regs) {
        self.regs = Some(Box::new(regs));
    }

    pub fn regs(&self) -> Option<&Regs> {
        self.regs.as_deref()
    }

    pub fn set_syscall(&mut self, syscall: Syscall) {
        self.syscall = Some(syscall);
    }

    pub fn syscall(&self) -> Option<&Syscall> {
        self.syscall.as_ref()
    }

    pub fn set_proc_maps(&mut self, maps: String) {
        self.proc_maps = Some(maps);
    }

    /// Full `/proc/<pid>/maps` content captured at termination.
    pub fn proc_maps(&self) -> Option<&str> {
        self.proc_maps.as_deref()
    }

    pub fn set_stack_trace(&mut self, trace: Vec<String>) {
        self.stack_trace = trace;
    }

    pub fn stack_trace(&self) -> &[String] {
        &self.stack_trace
    }

    pub fn set_prog_name(&mut self, name: String) {
        self.prog_name = name;
    }

    pub fn prog_name(&self) -> &str {
        &self.prog_name
    }

    pub fn set_network_violation(&mut self, msg: String) {
        self.network_violation = Some(msg);
    }

    pub fn network_violation(&self) -> Option<&str> {
        self.network_violation.as_deref()
    }

    pub fn set_rusage_monitor(&mut self, rusage: MonitorRusage) {
        self.rusage_monitor = Some(rusage);
    }

    pub fn rusage_monitor(&self) -> Option<&MonitorRusage> {
        self.rusage_monitor.as_ref()
    }
}

impl fmt::Display for SandboxResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.final_status {
            FinalStatus::Unset => write!(f, "UNSET"),
            FinalStatus::Ok(code) => write!(f, "OK (exit code: {code})"),
            FinalStatus::Signaled(sig) => {
                write!(f, "SIGNALED (signal: {})", crate::util::signal_name(sig))
            }
            FinalStatus::Timeout => write!(f, "TIMEOUT"),
            FinalStatus::ExternalKill => write!(f, "EXTERNAL_KILL"),
            FinalStatus::Violation(Violation::Syscall(nr)) => {
                write!(f, "VIOLATION (syscall: {nr})")?;
                if let Some(syscall) = &self.syscall {
                    write!(f, " {syscall}")?;
                }
                Ok(())
            }
            FinalStatus::Violation(Violation::ArchSwitch(nr)) => {
                write!(f, "VIOLATION (architecture switch, syscall: {nr})")
            }
            FinalStatus::Violation(Violation::Network) => {
                write!(
                    f,
                    "VIOLATION (network: {})",
                    self.network_violation.as_deref().unwrap_or("unknown")
                )
            }
            FinalStatus::SetupError(sub) => write!(f, "SETUP_ERROR ({sub:?})"),
            FinalStatus::InternalError(sub) => write!(f, "INTERNAL_ERROR ({sub:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_wins() {
        let mut result = SandboxResult::default();
        assert_eq!(result.final_status(), FinalStatus::Unset);

        result.set_final_status(FinalStatus::Timeout);
        assert_eq!(result.final_status(), FinalStatus::Timeout);

        result.set_final_status(FinalStatus::Signaled(libc::SIGKILL));
        assert_eq!(result.final_status(), FinalStatus::Timeout);
    }

    #[test]
    fn reason_codes() {
        let mut result = SandboxResult::default();
        result.set_final_status(FinalStatus::Ok(3));
        assert_eq!(result.reason_code(), 3);

        let mut result = SandboxResult::default();
        result.set_final_status(FinalStatus::Violation(Violation::Syscall(
            libc::SYS_socket as u64,
        )));
        assert_eq!(result.reason_code(), libc::SYS_socket);

        let mut result = SandboxResult::default();
        result.set_final_status(FinalStatus::Violation(Violation::ArchSwitch(
            libc::SYS_getpid as u64,
        )));
        assert_eq!(result.reason_code(), libc::SYS_getpid);

        let mut result = SandboxResult::default();
        result.set_final_status(FinalStatus::Violation(Violation::Network));
        assert_eq!(result.reason_code(), -1);
    }

    #[test]
    fn display_names_signal() {
        let mut result = SandboxResult::default();
        result.set_final_status(FinalStatus::Signaled(libc::SIGABRT));
        assert!(result.to_string().contains("SIGABRT"));
    }
}
