//! User callbacks for sandbox events.
//!
//! A `Notify` implementation rides along with the monitor and gets a say on
//! every traced syscall. The default implementation denies everything the
//! policy did not allow, which is the posture a fresh sandbox should have.

use log::warn;

use crate::comms::Comms;
use crate::result::SandboxResult;
use crate::syscall::Syscall;
use crate::util;

/// What to do with a traced syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceAction {
    /// Deny the syscall; the sandboxee is killed with a violation result.
    Deny,
    /// Let the syscall run.
    Allow,
    /// Let the syscall run, then report its return value through
    /// [`Notify::event_syscall_return`].
    InspectAfterReturn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationType {
    /// A syscall disallowed by the policy was invoked.
    Syscall,
    /// A syscall with a cpu architecture not covered by the policy.
    ArchitectureSwitch,
}

pub trait Notify: Send {
    /// The sandboxee exists and will exec shortly. Returning false aborts
    /// the run with a setup error.
    fn event_started(&mut self, pid: libc::pid_t, comms: &mut Comms) -> bool {
        let _ = (pid, comms);
        true
    }

    /// All sandboxed processes are finished.
    fn event_finished(&mut self, result: &SandboxResult) {
        let _ = result;
    }

    /// The policy returned TRACE for this syscall; decide its fate.
    fn event_syscall_trace(&mut self, syscall: &Syscall) -> TraceAction {
        let _ = syscall;
        TraceAction::Deny
    }

    /// Return value of a syscall that was traced with `InspectAfterReturn`.
    fn event_syscall_return(&mut self, syscall: &Syscall, return_value: i64) {
        let _ = (syscall, return_value);
    }

    /// The sandboxee is about to die for this syscall.
    fn event_syscall_violation(&mut self, syscall: &Syscall, kind: ViolationType) {
        let _ = (syscall, kind);
    }

    /// A signal is being delivered to a monitored process.
    fn event_signal(&mut self, pid: libc::pid_t, signo: i32) {
        let _ = (pid, signo);
    }
}

/// The default callback: deny traced syscalls, stay quiet otherwise.
#[derive(Debug, Default)]
pub struct DenyAllNotify;

impl Notify for DenyAllNotify {}

/// A callback that lets every traced syscall through, logging each one.
/// Useful while developing a policy.
#[derive(Debug, Default)]
pub struct PermitAndLogNotify;

impl Notify for PermitAndLogNotify {
    fn event_syscall_trace(&mut self, syscall: &Syscall) -> TraceAction {
        warn!(
            "[PERMITTED]: SYSCALL ::: PID: {}, PROG: '{}' : {}",
            syscall.pid(),
            util::prog_name(syscall.pid()),
            syscall
        );
        TraceAction::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::CpuArch;

    #[test]
    fn default_notify_denies() {
        let syscall = Syscall::new(CpuArch::host(), 0, [0; 6], 1, 0, 0);
        assert_eq!(
            DenyAllNotify.event_syscall_trace(&syscall),
            TraceAction::Deny
        );
    }

    #[test]
    fn permissive_notify_allows() {
        let syscall = Syscall::new(CpuArch::host(), 0, [0; 6], 1, 0, 0);
        assert_eq!(
            PermitAndLogNotify.event_syscall_trace(&syscall),
            TraceAction::Allow
        );
    }
}
