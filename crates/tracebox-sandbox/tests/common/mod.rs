//! Shared helpers for the monitor integration tests.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracebox_sandbox::notify::{Notify, TraceAction};
use tracebox_sandbox::syscall::Syscall;
use tracebox_sandbox::{Executor, Policy, PolicyBuilder};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Absolute path of a host binary.
pub fn host_binary(name: &str) -> PathBuf {
    if let Ok(path) = which::which(name) {
        return path;
    }
    for dir in ["/bin", "/usr/bin"] {
        let candidate = PathBuf::from(dir).join(name);
        if candidate.exists() {
            return candidate;
        }
    }
    panic!("host binary '{name}' not found");
}

/// An executor running `sh -c <script>`.
pub fn sh(script: &str) -> Executor {
    Executor::new(host_binary("sh"), &["-c", script])
}

/// A policy that lets a dynamically linked binary start up without
/// bothering the monitor; everything else is traced.
pub fn runtime_policy() -> PolicyBuilder {
    Policy::builder().allow_default_runtime()
}

/// Allows every traced syscall without logging; tests drive the full
/// seccomp-stop path but nothing gets denied.
#[derive(Default)]
pub struct AllowAllNotify;

impl Notify for AllowAllNotify {
    fn event_syscall_trace(&mut self, _syscall: &Syscall) -> TraceAction {
        TraceAction::Allow
    }
}

/// Allows everything, but asks for post-return inspection of one syscall
/// number and records the observed return values.
pub struct InspectNotify {
    pub inspect_nr: u64,
    pub seen: Arc<Mutex<Vec<(u64, i64)>>>,
}

impl Notify for InspectNotify {
    fn event_syscall_trace(&mut self, syscall: &Syscall) -> TraceAction {
        if syscall.nr() == self.inspect_nr {
            TraceAction::InspectAfterReturn
        } else {
            TraceAction::Allow
        }
    }

    fn event_syscall_return(&mut self, syscall: &Syscall, return_value: i64) {
        self.seen.lock().unwrap().push((syscall.nr(), return_value));
    }
}
