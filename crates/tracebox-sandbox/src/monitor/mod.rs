//! Monitor skeleton shared by monitor implementations.
//!
//! The split mirrors the two audiences a monitor has:
//!
//! - [`MonitorShared`] is the caller-facing surface: edge-triggered request
//!   flags, the deadline, and the two one-shot notifications (setup finished,
//!   run finished). Everything in it is atomic or lock-guarded.
//! - [`MonitorCore`] is owned by the monitor thread: the executor / policy /
//!   notify triple, the comms channel, and the result being assembled.
//!
//! The launch sequence (fork, policy handoff, rlimits) runs on the caller's
//! thread; only the event loop moves onto its own thread.

pub mod pid_waiter;
pub mod ptrace;

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, info, log_enabled};

use crate::comms::Comms;
use crate::config::MonitorOptions;
use crate::executor::{Executor, SandboxeeProcess};
use crate::notify::Notify;
use crate::policy::Policy;
use crate::regs::Regs;
use crate::result::{FinalStatus, SandboxResult, SetupFailure};
use crate::stack_trace;
use crate::syscall::Syscall;
use crate::util::{self, Notification};

/// The capability set every monitor flavor exposes.
pub trait Monitor {
    /// Requests sandboxee termination. Cooperative: await the result to see
    /// the attributed cause.
    fn kill(&self);

    /// Requests a stack dump of the main pid into the log.
    fn dump_stack_trace(&self);

    /// Arms or rewrites the wall-clock deadline; zero disarms it.
    fn set_wall_time_limit(&self, limit: Duration);

    /// Blocks until the run is over. Always returns a terminal result, and
    /// returns an equal result on every subsequent call.
    fn await_result(&mut self) -> SandboxResult;

    /// Wakes the monitor loop so it notices flag edges promptly.
    fn notify_monitor(&self);
}

pub fn now_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Caller-facing monitor state. All fields are safe to touch from any
/// thread; the monitor loop reads them once per iteration.
pub(crate) struct MonitorShared {
    pub deadline_millis: AtomicI64,
    pub external_kill_request: AtomicBool,
    pub dump_stack_request: AtomicBool,
    pub setup: Notification,
    pub done: Notification,
    /// pthread handle of the loop thread, 0 until it runs.
    pub monitor_thread: AtomicU64,
    pub main_pid: AtomicI32,
    pub result: Mutex<Option<SandboxResult>>,
}

impl MonitorShared {
    pub fn new() -> Self {
        Self {
            deadline_millis: AtomicI64::new(0),
            external_kill_request: AtomicBool::new(false),
            dump_stack_request: AtomicBool::new(false),
            setup: Notification::new(),
            done: Notification::new(),
            monitor_thread: AtomicU64::new(0),
            main_pid: AtomicI32::new(0),
            result: Mutex::new(None),
        }
    }

    pub fn wake_monitor(&self) {
        let thread = self.monitor_thread.load(Ordering::Acquire);
        if thread != 0 {
            let _ = tracebox_sys::signal::kill_thread(thread as libc::pthread_t, libc::SIGCHLD);
        }
    }
}

/// Monitor-thread-owned state.
pub(crate) struct MonitorCore {
    pub executor: Executor,
    pub policy: Policy,
    pub notify: Box<dyn Notify>,
    pub options: MonitorOptions,
    pub process: SandboxeeProcess,
    pub comms: Comms,
    pub result: SandboxResult,
    pub log_file: Option<std::fs::File>,
    pub shared: Arc<MonitorShared>,
}

impl MonitorCore {
    pub fn set_final_status(&mut self, status: FinalStatus) {
        self.result.set_final_status(status);
    }

    pub fn set_setup_error(&mut self, failure: SetupFailure) {
        self.result
            .set_final_status(FinalStatus::SetupError(failure));
    }

    /// Publishes the result and fires the done notification, exactly once.
    pub fn on_done(&mut self) {
        if self.shared.done.has_been_notified() {
            return;
        }
        self.notify.event_finished(&self.result);
        *self.shared.result.lock().unwrap() = Some(self.result.clone());
        self.shared.done.notify();
    }

    pub fn stack_trace_collection_possible(&self) -> bool {
        if self.options.disable_stack_traces {
            return false;
        }
        // Never unwind the unwinder.
        if self.executor.libunwind_sbox_for_pid() != 0 {
            error!(
                "cannot collect stack trace, executor is the unwinder for pid {}",
                self.executor.libunwind_sbox_for_pid()
            );
            return false;
        }
        true
    }

    pub fn should_collect_stack_trace(&self, status: FinalStatus) -> bool {
        if !self.stack_trace_collection_possible() {
            return false;
        }
        match status {
            FinalStatus::ExternalKill => self.policy.collect_stacktrace_on_kill,
            FinalStatus::Timeout => self.policy.collect_stacktrace_on_timeout,
            FinalStatus::Signaled(_) => self.policy.collect_stacktrace_on_signal,
            FinalStatus::Violation(_) => self.policy.collect_stacktrace_on_violation,
            FinalStatus::Ok(_) => self.policy.collect_stacktrace_on_exit,
            _ => false,
        }
    }

    pub fn get_stack_trace(&self, regs: &Regs) -> Result<Vec<String>, stack_trace::StackTraceError> {
        stack_trace::collect(regs, &self.options)
    }

    pub fn get_and_log_stack_trace(
        &self,
        regs: &Regs,
    ) -> Result<Vec<String>, stack_trace::StackTraceError> {
        let trace = self.get_stack_trace(regs)?;
        info!("Stack trace: [");
        for frame in stack_trace::compact_stack_trace(&trace) {
            info!("  {frame}");
        }
        info!("]");
        Ok(trace)
    }

    pub fn log_syscall_violation(&self, syscall: &Syscall) {
        if self.executor.libunwind_sbox_for_pid() != 0 {
            error!("Sandbox violation during execution of the unwinder: {syscall}");
            return;
        }

        error!(
            "SANDBOX VIOLATION : PID: {}, PROG: '{}' : {}",
            syscall.pid(),
            util::prog_name(syscall.pid()),
            syscall
        );
        if log_enabled!(log::Level::Debug) {
            if let Some(name) = util::proc_status_line(syscall.pid(), "Name") {
                log::debug!("Task Name: {name}");
            }
            if let Some(tgid) = util::proc_status_line(syscall.pid(), "Tgid") {
                log::debug!("Tgid: {tgid}");
            }
        }

        self.log_syscall_violation_explanation(syscall);
    }

    /// Extra context for the violations people hit most.
    fn log_syscall_violation_explanation(&self, syscall: &Syscall) {
        use crate::arch::CpuArch;

        if syscall.arch() != CpuArch::host() {
            error!(
                "This is a violation because the syscall was issued under a \
                 different architecture than the sandbox policy covers."
            );
            return;
        }
        let nr = syscall.nr() as i64;
        if nr == libc::SYS_ptrace {
            error!("This is a violation because the ptrace syscall would be unsafe inside the sandbox, so it has been blocked.");
        } else if nr == libc::SYS_bpf {
            error!("This is a violation because the bpf syscall would be risky inside a sandbox, so it has been blocked.");
        } else if nr == libc::SYS_clone && (syscall.args()[0] & libc::CLONE_UNTRACED as u64) != 0 {
            error!("This is a violation because calling clone with CLONE_UNTRACED would evade the tracer, so it has been blocked.");
        }
    }

    /// Releases the notify object when the core is torn down before the
    /// event loop ever ran.
    pub fn into_notify(self) -> Box<dyn Notify> {
        self.notify
    }
}
