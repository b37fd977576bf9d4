//! The front object callers hold.
//!
//! A `Sandbox` bundles an executor, a policy and a notify object, launches
//! the ptrace monitor on first use, and forwards control operations. The
//! result can be awaited any number of times and is always terminal.

use std::time::Duration;

use crate::config::MonitorOptions;
use crate::executor::Executor;
use crate::monitor::Monitor;
use crate::monitor::ptrace::{AwaitTimeout, PtraceMonitor};
use crate::notify::{DenyAllNotify, Notify};
use crate::policy::Policy;
use crate::result::SandboxResult;

pub struct Sandbox {
    executor: Option<Executor>,
    policy: Option<Policy>,
    notify: Option<Box<dyn Notify>>,
    options: MonitorOptions,
    monitor: Option<PtraceMonitor>,
}

impl Sandbox {
    /// A sandbox with the default (deny-everything-traced) notify object.
    pub fn new(executor: Executor, policy: Policy) -> Sandbox {
        Sandbox::with_notify(executor, policy, Box::new(DenyAllNotify))
    }

    pub fn with_notify(executor: Executor, policy: Policy, notify: Box<dyn Notify>) -> Sandbox {
        Sandbox {
            executor: Some(executor),
            policy: Some(policy),
            notify: Some(notify),
            options: MonitorOptions::default(),
            monitor: None,
        }
    }

    /// Overrides the monitor options. Only effective before the launch.
    pub fn set_monitor_options(&mut self, options: MonitorOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// Runs the sandboxee and blocks until there is a result.
    pub fn run(&mut self) -> SandboxResult {
        self.run_async();
        self.await_result()
    }

    /// Starts the sandboxee asynchronously. Returns whether the setup
    /// succeeded; even when it did not, [`Sandbox::await_result`] yields the
    /// specific failure.
    pub fn run_async(&mut self) -> bool {
        if self.monitor.is_none() {
            let executor = self.executor.take().expect("sandbox launched twice");
            let policy = self.policy.take().expect("sandbox launched twice");
            let notify = self.notify.take().expect("sandbox launched twice");
            self.monitor = Some(PtraceMonitor::launch(
                executor,
                policy,
                notify,
                self.options.clone(),
            ));
        }
        let monitor = self.monitor.as_ref().expect("monitor just launched");
        !monitor.setup_error_occurred()
    }

    /// Waits for the run to finish. Repeated calls return equal results.
    pub fn await_result(&mut self) -> SandboxResult {
        let monitor = self.monitor.as_mut().expect("run_async() first");
        monitor.await_result()
    }

    /// Waits up to `timeout` for the run to finish.
    pub fn await_result_with_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<SandboxResult, AwaitTimeout> {
        let monitor = self.monitor.as_mut().expect("run_async() first");
        monitor.await_result_with_timeout(timeout)
    }

    /// Requests termination. The run must still be awaited; it may finish
    /// for another reason before the request lands.
    pub fn kill(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.kill();
        }
    }

    /// Asks the monitor to log the main pid's current stack.
    pub fn dump_stack_trace(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.dump_stack_trace();
        }
    }

    /// Arms or rewrites the wall-clock limit of a running sandboxee; zero
    /// disarms. Useful for persistent sandboxes that get a fresh deadline
    /// per request.
    pub fn set_walltime_limit(&self, limit: Duration) {
        if let Some(monitor) = &self.monitor {
            monitor.set_wall_time_limit(limit);
        }
    }

    /// The sandboxee's main pid, or -1 before launch.
    pub fn pid(&self) -> libc::pid_t {
        self.monitor.as_ref().map_or(-1, PtraceMonitor::pid)
    }

    pub fn is_terminated(&self) -> bool {
        self.monitor.as_ref().is_some_and(PtraceMonitor::is_done)
    }
}
