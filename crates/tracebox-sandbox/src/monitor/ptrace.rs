//! The ptrace monitor: a single-threaded event loop over a seized tree.
//!
//! One OS thread per sandbox. The loop's only suspension points are a
//! non-blocking `waitpid` sweep (through [`PidWaiter`]) and a bounded
//! `sigtimedwait` on SIGCHLD. External threads never touch the tracee; they
//! flip a flag and wake the loop with a thread-directed SIGCHLD.
//!
//! Every ptrace stop gets exactly one continuation (CONT, LISTEN or SYSCALL)
//! before the next wait. Tasks that die between the stop and our response
//! surface as ESRCH, which is logged and forgotten; their exit event is
//! already queued.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use rustix::io::Errno;
use thiserror::Error;
use tracebox_sys::ptrace as sys_ptrace;
use tracebox_sys::ptrace::{SEIZE_OPTIONS, SYSCALL_EXIT_SIG, wait_event};
use tracebox_sys::signal as sys_signal;

use crate::arch::CpuArch;
use crate::client;
use crate::comms::{CLIENT_DONE, CLIENT_READY};
use crate::config::MonitorOptions;
use crate::executor::Executor;
use crate::monitor::pid_waiter::PidWaiter;
use crate::monitor::{Monitor, MonitorCore, MonitorShared, now_unix_millis};
use crate::notify::{Notify, TraceAction, ViolationType};
use crate::policy::Policy;
use crate::regs::Regs;
use crate::result::{FinalStatus, MonitorFailure, SandboxResult, SetupFailure, Violation};
use crate::syscall::Syscall;
use crate::util;

/// How long the loop parks in sigtimedwait when no child is ready.
const WAKE_UP_PERIOD: Duration = Duration::from_millis(250);

/// Grace period for reaping stragglers after the main process is gone.
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_millis(200);

/// EPERM retry budget during attach.
const ATTACH_DEADLINE: Duration = Duration::from_secs(2);
const ATTACH_INITIAL_RETRY: Duration = Duration::from_millis(1);
const ATTACH_MAX_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
#[error("sandbox did not finish within the timeout")]
pub struct AwaitTimeout;

fn sigkill_process(pid: libc::pid_t) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::SIGKILL).is_ok()
}

fn continue_process(pid: libc::pid_t, signo: libc::c_int) {
    if let Err(errno) = sys_ptrace::cont(pid, signo) {
        if errno == Errno::SRCH {
            warn!("process {pid} died while trying to PTRACE_CONT it");
        } else {
            error!("ptrace(PTRACE_CONT, pid={pid}, sig={signo}): {errno}");
        }
    }
}

fn stop_process(pid: libc::pid_t) {
    if let Err(errno) = sys_ptrace::listen(pid) {
        if errno == Errno::SRCH {
            warn!("process {pid} died while trying to PTRACE_LISTEN it");
        } else {
            error!("ptrace(PTRACE_LISTEN, pid={pid}): {errno}");
        }
    }
}

fn complete_syscall(pid: libc::pid_t) {
    if let Err(errno) = sys_ptrace::syscall(pid, 0) {
        if errno == Errno::SRCH {
            warn!("process {pid} died while trying to PTRACE_SYSCALL it");
        } else {
            error!("ptrace(PTRACE_SYSCALL, pid={pid}): {errno}");
        }
    }
}

/// A launch that never reached the event loop.
struct SetupAbort {
    notify: Box<dyn Notify>,
    failure: SetupFailure,
}

/// Handle to a running (or already finished) ptrace monitor.
pub struct PtraceMonitor {
    shared: Arc<MonitorShared>,
    thread: Option<JoinHandle<()>>,
}

impl PtraceMonitor {
    /// Runs the full launch sequence and, on success, starts the event loop
    /// thread. Always returns a monitor whose `await_result` terminates:
    /// setup failures are already folded into the result.
    pub fn launch(
        executor: Executor,
        policy: Policy,
        notify: Box<dyn Notify>,
        options: MonitorOptions,
    ) -> PtraceMonitor {
        let shared = Arc::new(MonitorShared::new());

        let wall_limit = executor.limits().wall_time_limit();
        if wall_limit != Duration::ZERO {
            shared
                .deadline_millis
                .store(now_unix_millis() + wall_limit.as_millis() as i64, Ordering::Relaxed);
        }

        let core = match Self::setup(executor, policy, notify, options, &shared) {
            Ok(core) => core,
            Err(SetupAbort {
                mut notify,
                failure,
            }) => {
                let mut result = SandboxResult::default();
                result.set_final_status(FinalStatus::SetupError(failure));
                notify.event_finished(&result);
                *shared.result.lock().unwrap() = Some(result);
                shared.setup.notify();
                shared.done.notify();
                return PtraceMonitor {
                    shared,
                    thread: None,
                };
            }
        };

        let thread = std::thread::Builder::new()
            .name("tracebox-monitor".into())
            .spawn(move || {
                core.shared
                    .monitor_thread
                    // SAFETY: reading our own pthread handle.
                    .store(unsafe { libc::pthread_self() } as u64, Ordering::Release);
                let shared = Arc::clone(&core.shared);
                PtraceLoop::new(core).run();
                // Belt and suspenders: whatever path the loop took, both
                // notifications must have fired by now.
                shared.setup.notify();
                shared.done.notify();
            })
            .expect("spawning monitor thread");

        // Block until attach finished one way or the other; from here on the
        // comms channel is free for user traffic.
        shared.setup.wait();

        PtraceMonitor {
            shared,
            thread: Some(thread),
        }
    }

    /// The pre-thread part of the launch: fork, notify, policy handoff,
    /// rlimits. Returns the aborting notify object and failure kind when a
    /// step fails; the sandboxee (if it was forked) is already killed.
    fn setup(
        executor: Executor,
        policy: Policy,
        notify: Box<dyn Notify>,
        options: MonitorOptions,
        shared: &Arc<MonitorShared>,
    ) -> Result<MonitorCore, SetupAbort> {
        if let Err(err) = tracebox_sys::check() {
            error!("system capability check failed: {err}");
            return Err(SetupAbort {
                notify,
                failure: SetupFailure::Ptrace,
            });
        }

        let (process, comms) = match executor.start_subprocess() {
            Ok(started) => started,
            Err(err) => {
                error!("starting sandboxed subprocess failed: {err}");
                return Err(SetupAbort {
                    notify,
                    failure: SetupFailure::Subprocess,
                });
            }
        };

        shared.main_pid.store(process.main_pid, Ordering::Release);
        let mut core = MonitorCore {
            executor,
            policy,
            notify,
            options,
            process,
            comms,
            result: SandboxResult::default(),
            log_file: None,
            shared: Arc::clone(shared),
        };

        match Self::setup_steps(&mut core) {
            Ok(()) => Ok(core),
            Err(failure) => {
                // The pair dies with us; EXITKILL is not armed yet.
                if let Some(init_pid) = core.process.init_pid {
                    sigkill_process(init_pid);
                } else {
                    sigkill_process(core.process.main_pid);
                }
                // Reap the child so no zombie outlives the failed launch.
                let _ = sys_ptrace::waitpid(core.process.main_pid, 0);
                Err(SetupAbort {
                    notify: core.into_notify(),
                    failure,
                })
            }
        }
    }

    fn setup_steps(core: &mut MonitorCore) -> Result<(), SetupFailure> {
        if !core.notify.event_started(core.process.main_pid, &mut core.comms) {
            return Err(SetupFailure::Notify);
        }
        let filter_bytes = client::encode_filter(core.policy.filter());
        if let Err(err) = core.comms.send_bytes(&filter_bytes) {
            error!("couldn't send policy: {err}");
            return Err(SetupFailure::Policy);
        }
        match core.comms.recv_u32() {
            Ok(CLIENT_READY) => {}
            Ok(other) => {
                error!("expected client-ready token, got {other:#x}");
                return Err(SetupFailure::Wait);
            }
            Err(err) => {
                error!("couldn't receive client-ready: {err}");
                return Err(SetupFailure::Wait);
            }
        }
        if let Err(err) = core.executor.limits().apply_to(core.process.main_pid) {
            error!("applying limits failed: {err}");
            return Err(SetupFailure::Limits);
        }
        if let Some(path) = &core.options.permit_all_and_log {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => core.log_file = Some(file),
                Err(err) => {
                    error!("failed to open syscall log file {}: {err}", path.display());
                    return Err(SetupFailure::Policy);
                }
            }
        }
        Ok(())
    }

    /// The main sandboxee pid, 0 when the subprocess never started.
    pub fn pid(&self) -> libc::pid_t {
        self.shared.main_pid.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.has_been_notified()
    }

    /// True when a published result already marks the launch as failed.
    pub fn setup_error_occurred(&self) -> bool {
        matches!(
            self.shared.result.lock().unwrap().as_ref().map(SandboxResult::final_status),
            Some(FinalStatus::SetupError(_))
        )
    }

    pub fn await_result_with_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<SandboxResult, AwaitTimeout> {
        if !self.shared.done.wait_timeout(timeout) {
            return Err(AwaitTimeout);
        }
        Ok(self.take_result())
    }

    fn take_result(&mut self) -> SandboxResult {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let result = self
            .shared
            .result
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default();
        debug_assert!(result.final_status().is_terminal());
        result
    }
}

impl Monitor for PtraceMonitor {
    fn kill(&self) {
        self.shared
            .external_kill_request
            .store(true, Ordering::Release);
        self.notify_monitor();
    }

    fn dump_stack_trace(&self) {
        self.shared.dump_stack_request.store(true, Ordering::Release);
        self.notify_monitor();
    }

    fn set_wall_time_limit(&self, limit: Duration) {
        if limit == Duration::ZERO {
            debug!("disarming the walltime timer");
            self.shared.deadline_millis.store(0, Ordering::Relaxed);
        } else {
            debug!("setting the walltime timer to {limit:?}");
            self.shared
                .deadline_millis
                .store(now_unix_millis() + limit.as_millis() as i64, Ordering::Relaxed);
        }
    }

    fn await_result(&mut self) -> SandboxResult {
        self.shared.done.wait();
        self.take_result()
    }

    fn notify_monitor(&self) {
        self.shared.wake_monitor();
    }
}

impl Drop for PtraceMonitor {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The event loop proper. Lives entirely on the monitor thread.
struct PtraceLoop {
    core: MonitorCore,
    /// False once the first execve event was seen (or from the start when
    /// sandboxing is not applied pre-execve).
    wait_for_execve: bool,
    external_kill: bool,
    timed_out: bool,
    network_violation: bool,
    should_dump_stack: bool,
    /// Syscalls whose return value the notify handler asked to inspect.
    syscalls_in_progress: HashMap<libc::pid_t, Syscall>,
    sset: libc::sigset_t,
    sandboxee_exited: bool,
    pid_waiter: PidWaiter,
}

impl PtraceLoop {
    fn new(core: MonitorCore) -> Self {
        let wait_for_execve = core.executor.enable_sandboxing_pre_execve();
        let pid_waiter = PidWaiter::new(core.process.main_pid);
        Self {
            core,
            wait_for_execve,
            external_kill: false,
            timed_out: false,
            network_violation: false,
            should_dump_stack: false,
            syscalls_in_progress: HashMap::new(),
            sset: sys_signal::sigset_of(&[libc::SIGCHLD]),
            sandboxee_exited: false,
            pid_waiter,
        }
    }

    fn main_pid(&self) -> libc::pid_t {
        self.core.process.main_pid
    }

    fn is_actively_monitoring(&self) -> bool {
        !self.wait_for_execve
    }

    fn run(mut self) {
        match self.initialize() {
            Ok(()) => {
                self.core.shared.setup.notify();
                self.event_loop();
                self.shutdown();
                self.core.result.set_rusage_monitor(util::thread_rusage());
                self.core.on_done();
            }
            Err(failure) => {
                // Publish the failed result before unblocking the launcher,
                // so a caller that saw the setup notification always finds
                // a terminal status behind it.
                self.core.set_setup_error(failure);
                self.core.result.set_rusage_monitor(util::thread_rusage());
                self.core.on_done();
                self.core.shared.setup.notify();
            }
        }
    }

    fn initialize(&mut self) -> Result<(), SetupFailure> {
        if !self.init_setup_signals() {
            return Err(SetupFailure::Signals);
        }
        // Last step of the init sequence: attach can leave the sandboxee in
        // a ptrace-stopped state where it cannot speak over comms anymore.
        if !self.init_ptrace_attach() {
            return Err(SetupFailure::Ptrace);
        }
        Ok(())
    }

    fn init_setup_signals(&mut self) -> bool {
        // Only sigtimedwait may see SIGCHLD on this thread; that closes the
        // race between "flag set + wake signal" and "loop about to sleep".
        match sys_signal::block_on_current_thread(&self.sset) {
            Ok(()) => true,
            Err(errno) => {
                error!("pthread_sigmask(SIG_BLOCK, SIGCHLD): {errno}");
                false
            }
        }
    }

    fn init_ptrace_attach(&mut self) -> bool {
        if let Some(init_pid) = self.core.process.init_pid {
            if let Err(errno) = sys_ptrace::seize(init_pid, libc::PTRACE_O_EXITKILL) {
                if errno != Errno::SRCH {
                    error!("attaching to init process {init_pid} failed: {errno}");
                }
                return false;
            }
        }

        let main_pid = self.main_pid();
        let mut tasks = match util::list_tasks(main_pid) {
            Ok(tasks) => tasks,
            Err(err) => {
                error!("could not get list of tasks for {main_pid}: {err}");
                return false;
            }
        };

        if !tasks.contains(&main_pid) {
            error!("pid {main_pid} was not found in its own task list");
            return false;
        }

        if tasks.len() > 1 {
            warn!(
                "pid {main_pid} has {} threads at attach time; more sandbox \
                 violations than expected may be the result",
                tasks.len()
            );
        }

        let mut tasks_attached = std::collections::HashSet::new();
        let mut retries = 0u32;
        let deadline = Instant::now() + ATTACH_DEADLINE;

        // EPERM can show up transiently while a task is exiting; retry those
        // with exponential backoff until the budget runs out.
        while !tasks.is_empty() {
            let mut tasks_left = std::collections::HashSet::new();
            for &task in &tasks {
                match sys_ptrace::seize(task, SEIZE_OPTIONS) {
                    Ok(()) => {
                        tasks_attached.insert(task);
                    }
                    Err(Errno::PERM) => {
                        warn!("ptrace(PTRACE_SEIZE, {task}) returned EPERM, trying again");
                        tasks_left.insert(task);
                    }
                    Err(Errno::SRCH) => {
                        warn!("ptrace(PTRACE_SEIZE, {task}): task exited, skipping");
                    }
                    Err(errno) => {
                        error!("ptrace(PTRACE_SEIZE, {task}, {SEIZE_OPTIONS:#x}) failed: {errno}");
                        return false;
                    }
                }
            }
            if !tasks_left.is_empty() {
                if Instant::now() >= deadline {
                    error!(
                        "attaching to sandboxee timed out: could not attach to {} tasks",
                        tasks_left.len()
                    );
                    return false;
                }
                let retry_interval = ATTACH_INITIAL_RETRY * (1 << retries.min(10));
                retries += 1;
                std::thread::sleep(retry_interval.min(ATTACH_MAX_RETRY));
            }
            tasks = tasks_left;
        }

        // The sandboxee may have raced a thread into existence mid-attach.
        let tasks_now = match util::list_tasks(main_pid) {
            Ok(tasks) => tasks,
            Err(err) => {
                error!("could not get list of tasks for {main_pid}: {err}");
                return false;
            }
        };
        if tasks_attached != tasks_now {
            error!("pid {main_pid} spawned new threads while we were attaching to it");
            return false;
        }

        debug!("monitor attached to pid {main_pid} ({} tasks)", tasks_attached.len());

        // The channel is buffered, so this cannot block even if the
        // sandboxee is already sitting in a ptrace stop.
        if let Err(err) = self.core.comms.send_u32(CLIENT_DONE) {
            error!("couldn't send the client-done token: {err}");
            return false;
        }
        true
    }

    fn event_loop(&mut self) {
        while self.core.result.final_status() == FinalStatus::Unset {
            let deadline = self.core.shared.deadline_millis.load(Ordering::Relaxed);
            if deadline != 0 && now_unix_millis() >= deadline {
                debug!("sandboxee hit the walltime deadline");
                self.timed_out = true;
                if !self.kill_sandboxee() {
                    break;
                }
            }

            if self.core.shared.dump_stack_request.swap(false, Ordering::AcqRel) {
                self.should_dump_stack = true;
                if !self.interrupt_sandboxee() {
                    break;
                }
            }

            if self.core.shared.external_kill_request.swap(false, Ordering::AcqRel) {
                self.external_kill = true;
                if !self.kill_sandboxee() {
                    break;
                }
            }

            if !self.network_violation {
                if let Some(proxy) = self.core.policy.network_proxy() {
                    if proxy.violation_occurred() {
                        self.network_violation = true;
                        if !self.kill_sandboxee() {
                            break;
                        }
                    }
                }
            }

            let (pid, status) = match self.pid_waiter.wait() {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    match sys_signal::sigtimedwait(&self.sset, WAKE_UP_PERIOD) {
                        Ok(signo) if signo != libc::SIGCHLD => {
                            error!("unknown signal received: {signo}");
                        }
                        _ => {}
                    }
                    continue;
                }
                Err(Errno::CHILD) => {
                    error!("the main process has not exited yet we have no children to wait for");
                    self.core
                        .set_final_status(FinalStatus::InternalError(MonitorFailure::Child));
                    continue;
                }
                Err(errno) => {
                    error!("waitpid() failed: {errno}");
                    continue;
                }
            };

            trace!("waitpid() returned PID: {pid}, status: {status:#x}");

            if libc::WIFEXITED(status) {
                debug!("PID: {pid} finished with code {}", libc::WEXITSTATUS(status));
                if pid == self.main_pid() {
                    if self.is_actively_monitoring() {
                        self.core
                            .set_final_status(FinalStatus::Ok(libc::WEXITSTATUS(status)));
                    } else {
                        // Exited before its execve: the client rendezvous
                        // fell apart.
                        self.core.set_setup_error(SetupFailure::Monitor);
                    }
                    self.sandboxee_exited = true;
                }
            } else if libc::WIFSIGNALED(status) {
                // Usually the exit event arrives first; a SIGKILL may skip it.
                debug!(
                    "PID: {pid} terminated with {}",
                    util::signal_name(libc::WTERMSIG(status))
                );
                if pid == self.main_pid() {
                    self.set_main_exit_status_by_cause(libc::WTERMSIG(status));
                    self.sandboxee_exited = true;
                }
            } else if libc::WIFSTOPPED(status) {
                trace!(
                    "PID: {pid} stopped by {} event {}",
                    util::signal_name(libc::WSTOPSIG(status)),
                    util::ptrace_event_name(wait_event(status))
                );
                self.state_process_stopped(pid, status);
            } else if libc::WIFCONTINUED(status) {
                trace!("PID: {pid} is being continued");
            }
        }
    }

    /// The cause priority when the main process dies to a signal:
    /// network violation, then external kill, then timeout, then the signal
    /// itself. Linux reports the same SIGKILL for the first three.
    fn set_main_exit_status_by_cause(&mut self, signo: libc::c_int) {
        if self.network_violation {
            self.core
                .set_final_status(FinalStatus::Violation(Violation::Network));
            if let Some(proxy) = self.core.policy.network_proxy() {
                self.core
                    .result
                    .set_network_violation(proxy.violation_message());
            }
        } else if self.external_kill {
            self.core.set_final_status(FinalStatus::ExternalKill);
        } else if self.timed_out {
            self.core.set_final_status(FinalStatus::Timeout);
        } else {
            self.core.set_final_status(FinalStatus::Signaled(signo));
        }
    }

    fn kill_sandboxee(&mut self) -> bool {
        debug!("sending SIGKILL to the main pid {}", self.main_pid());
        if !sigkill_process(self.main_pid()) {
            error!("could not send SIGKILL to pid {}", self.main_pid());
            self.core
                .set_final_status(FinalStatus::InternalError(MonitorFailure::Kill));
            return false;
        }
        true
    }

    fn interrupt_sandboxee(&mut self) -> bool {
        if let Err(errno) = sys_ptrace::interrupt(self.main_pid()) {
            error!("could not interrupt pid {}: {errno}", self.main_pid());
            self.core
                .set_final_status(FinalStatus::InternalError(MonitorFailure::Interrupt));
            return false;
        }
        true
    }

    fn state_process_stopped(&mut self, pid: libc::pid_t, status: libc::c_int) {
        let stopsig = libc::WSTOPSIG(status);
        // TRACESYSGOOD tags syscall-exit-stops in the stop signal itself, so
        // no PTRACE_GETSIGINFO round trip is needed.
        let is_syscall_exit = stopsig == SYSCALL_EXIT_SIG;

        if wait_event(status) == 0 && !is_syscall_exit {
            // Regular signal delivery.
            trace!("PID: {pid} received signal {}", util::signal_name(stopsig));
            self.core.notify.event_signal(pid, stopsig);
            continue_process(pid, stopsig);
            return;
        }

        let event_msg = match sys_ptrace::get_event_msg(pid) {
            Ok(msg) => msg,
            Err(Errno::SRCH) => {
                // The kernel does not guarantee the event sticks around.
                info!("ptrace(PTRACE_GETEVENTMSG, {pid}): process gone");
                return;
            }
            Err(errno) => {
                error!("ptrace(PTRACE_GETEVENTMSG, {pid}): {errno}");
                self.core
                    .set_final_status(FinalStatus::InternalError(MonitorFailure::GetEvent));
                return;
            }
        };

        if pid == self.main_pid()
            && self.should_dump_stack
            && self.core.executor.libunwind_sbox_for_pid() == 0
        {
            self.dump_main_stack(pid);
            self.should_dump_stack = false;
        }

        if is_syscall_exit {
            trace!("PID: {pid} syscall-exit-stop: {event_msg}");
            self.event_syscall_exit(pid);
            return;
        }

        match wait_event(status) {
            libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
                trace!("PID: {pid} new process event, child: {event_msg}");
                self.event_ptrace_new_process(pid, event_msg);
            }
            libc::PTRACE_EVENT_VFORK_DONE => {
                continue_process(pid, 0);
            }
            libc::PTRACE_EVENT_EXEC => {
                trace!("PID: {pid} PTRACE_EVENT_EXEC, PID: {event_msg}");
                self.event_ptrace_exec(pid);
            }
            libc::PTRACE_EVENT_EXIT => {
                trace!("PID: {pid} PTRACE_EVENT_EXIT: {event_msg}");
                self.event_ptrace_exit(pid, event_msg as libc::c_int);
            }
            libc::PTRACE_EVENT_STOP => {
                trace!("PID: {pid} PTRACE_EVENT_STOP: {event_msg}");
                self.event_ptrace_stop(pid, stopsig);
            }
            libc::PTRACE_EVENT_SECCOMP => {
                trace!("PID: {pid} PTRACE_EVENT_SECCOMP: {event_msg}");
                self.event_ptrace_seccomp(pid, event_msg);
            }
            event => {
                error!("unknown ptrace event {event} with data {event_msg}");
            }
        }
    }

    fn dump_main_stack(&mut self, pid: libc::pid_t) {
        let mut regs = Regs::new(pid);
        let stack = match regs.fetch() {
            Ok(()) => self.core.get_stack_trace(&regs),
            Err(err) => {
                warn!("failed to get sandbox stack: {err}");
                return;
            }
        };
        match stack {
            Ok(frames) => {
                info!("SANDBOX STACK: PID: {pid}, [");
                for frame in &frames {
                    info!("  {frame}");
                }
                info!("]");
            }
            Err(err) => warn!("failed to get sandbox stack: {err}"),
        }
    }

    fn event_ptrace_seccomp(&mut self, pid: libc::pid_t, event_msg: u64) {
        let Some(syscall_arch) = CpuArch::from_tag(event_msg) else {
            // A process that already exited can leave its exit status in the
            // event message before we see the exit event. Out-of-range tag
            // means exactly that: drop the event, the exit will follow.
            warn!(
                "received event_msg for unknown architecture: {event_msg}; \
                 the program may have exited"
            );
            return;
        };

        let mut regs = Regs::new(pid);
        if let Err(err) = regs.fetch() {
            if err.is_not_found() {
                warn!("failed to fetch regs: {err}");
                return;
            }
            error!("failed to fetch regs: {err}");
            self.core
                .set_final_status(FinalStatus::InternalError(MonitorFailure::Fetch));
            return;
        }

        let syscall = regs.to_syscall(syscall_arch);
        if syscall_arch != CpuArch::host() {
            self.action_process_syscall_violation(
                &mut regs,
                &syscall,
                ViolationType::ArchitectureSwitch,
            );
            return;
        }

        self.action_process_syscall(&mut regs, syscall);
    }

    fn action_process_syscall(&mut self, regs: &mut Regs, syscall: Syscall) {
        // Before the sandbox is formally enforced, the client's own exec of
        // the target is let through.
        let nr = syscall.nr() as i64;
        if (nr == libc::SYS_execve || nr == libc::SYS_execveat) && !self.is_actively_monitoring() {
            debug!(
                "[PERMITTED/BEFORE_EXEC]: SYSCALL ::: PID: {}, PROG: '{}' : {}",
                regs.pid(),
                util::prog_name(regs.pid()),
                syscall
            );
            continue_process(regs.pid(), 0);
            return;
        }

        match self.core.notify.event_syscall_trace(&syscall) {
            TraceAction::Allow => {
                continue_process(regs.pid(), 0);
            }
            TraceAction::InspectAfterReturn => {
                // A process can die without a syscall-exit-stop (thread group
                // leader death during execve); the exit event wipes the entry.
                self.syscalls_in_progress.insert(regs.pid(), syscall);
                complete_syscall(regs.pid());
            }
            TraceAction::Deny => {
                if let Some(file) = self.core.log_file.as_mut() {
                    use std::io::Write as _;
                    let _ = writeln!(file, "PID: {} {}", regs.pid(), syscall);
                    continue_process(regs.pid(), 0);
                    return;
                }
                if self.core.options.permit_all {
                    continue_process(regs.pid(), 0);
                    return;
                }
                self.action_process_syscall_violation(regs, &syscall, ViolationType::Syscall);
            }
        }
    }

    fn action_process_syscall_violation(
        &mut self,
        regs: &mut Regs,
        syscall: &Syscall,
        violation_type: ViolationType,
    ) {
        self.core.log_syscall_violation(syscall);
        self.core.notify.event_syscall_violation(syscall, violation_type);
        let violation = match violation_type {
            ViolationType::Syscall => Violation::Syscall(syscall.nr()),
            ViolationType::ArchitectureSwitch => Violation::ArchSwitch(syscall.nr()),
        };
        self.core
            .set_final_status(FinalStatus::Violation(violation));
        self.core.result.set_syscall(*syscall);
        self.set_additional_result_info(*regs);
        // Rewrite the syscall to something invalid; the process dies anyway,
        // this closes the window until the SIGKILL lands.
        if let Err(err) = regs.skip_syscall_return_value(-i64::from(libc::ENOSYS)) {
            error!("skipping syscall failed: {err}");
        }
    }

    /// Registers snapshot, program name, maps, and (policy permitting) the
    /// symbolized stack trace.
    fn set_additional_result_info(&mut self, regs: Regs) {
        let pid = regs.pid();
        self.core.result.set_regs(regs);
        self.core.result.set_prog_name(util::prog_name(pid));
        self.core
            .result
            .set_proc_maps(util::read_proc_maps(pid).unwrap_or_default());

        if !self
            .core
            .should_collect_stack_trace(self.core.result.final_status())
        {
            debug!("stack traces have been disabled");
            return;
        }
        match self.core.get_and_log_stack_trace(&regs) {
            Ok(trace) => self.core.result.set_stack_trace(trace),
            Err(err) => error!("could not obtain stack trace: {err}"),
        }
    }

    fn event_syscall_exit(&mut self, pid: libc::pid_t) {
        let Some(syscall) = self.syscalls_in_progress.get(&pid).copied() else {
            error!("expected a syscall in progress in PID {pid}");
            self.core
                .set_final_status(FinalStatus::InternalError(MonitorFailure::Inspect));
            return;
        };
        let mut regs = Regs::new(pid);
        if let Err(err) = regs.fetch() {
            if err.is_not_found() {
                warn!("failed to fetch regs: {err}");
                return;
            }
            error!("failed to fetch regs: {err}");
            self.core
                .set_final_status(FinalStatus::InternalError(MonitorFailure::Fetch));
            return;
        }
        let return_value = regs.return_value();
        self.core.notify.event_syscall_return(&syscall, return_value);
        self.syscalls_in_progress.remove(&pid);
        continue_process(pid, 0);
    }

    fn event_ptrace_new_process(&mut self, pid: libc::pid_t, event_msg: u64) {
        // No syscall-exit-stop is issued for a successful clone family
        // syscall, so a pending inspect entry is settled here.
        if let Some(syscall) = self.syscalls_in_progress.get(&pid).copied() {
            if !is_clone_family(syscall.nr() as i64) {
                error!(
                    "expected a fork/vfork/clone syscall in progress in PID {pid}; actual: {syscall}"
                );
                self.core
                    .set_final_status(FinalStatus::InternalError(MonitorFailure::Inspect));
                return;
            }
            self.core
                .notify
                .event_syscall_return(&syscall, event_msg as i64);
            self.syscalls_in_progress.remove(&pid);
        }
        continue_process(pid, 0);
    }

    fn event_ptrace_exec(&mut self, pid: libc::pid_t) {
        if !self.is_actively_monitoring() {
            debug!("PTRACE_EVENT_EXEC seen from PID: {pid}. SANDBOX ENABLED!");
            self.wait_for_execve = false;
        } else if let Some(syscall) = self.syscalls_in_progress.get(&pid).copied() {
            // Same as the clone family: a successful exec never reaches its
            // syscall-exit-stop.
            let nr = syscall.nr() as i64;
            if nr != libc::SYS_execve && nr != libc::SYS_execveat {
                error!(
                    "expected an execve/execveat syscall in progress in PID {pid}; actual: {syscall}"
                );
                self.core
                    .set_final_status(FinalStatus::InternalError(MonitorFailure::Inspect));
                return;
            }
            self.core.notify.event_syscall_return(&syscall, 0);
            self.syscalls_in_progress.remove(&pid);
        }
        continue_process(pid, 0);
    }

    fn event_ptrace_exit(&mut self, pid: libc::pid_t, event_msg: libc::c_int) {
        // Whatever was in flight for this task is over now.
        self.syscalls_in_progress.remove(&pid);

        // Fast path: plain exit of a process nobody needs a trace of.
        if libc::WIFEXITED(event_msg)
            && (!self.core.policy.collect_stacktrace_on_exit || pid != self.main_pid())
        {
            continue_process(pid, 0);
            return;
        }

        // Some kernels deliver the exit event for a seccomp kill before the
        // signaled status, some don't deliver it at all; both orders are
        // handled (see the WIFSIGNALED arm of the event loop).
        let is_seccomp =
            libc::WIFSIGNALED(event_msg) && libc::WTERMSIG(event_msg) == libc::SIGSYS;
        let log_stack_trace = self.core.options.log_all_stack_traces;

        let mut regs = Regs::new(pid);
        if is_seccomp || pid == self.main_pid() || log_stack_trace {
            if let Err(err) = regs.fetch() {
                error!("failed to fetch regs: {err}");
                self.core
                    .set_final_status(FinalStatus::InternalError(MonitorFailure::Fetch));
                return;
            }
        }

        if is_seccomp {
            debug!("PID: {pid} violation uncovered via the exit event");
            let syscall = regs.to_syscall(CpuArch::host());
            self.action_process_syscall_violation(&mut regs, &syscall, ViolationType::Syscall);
            return;
        }

        if pid == self.main_pid() {
            debug!("PID: {pid} main exit with status {event_msg:#x}");
            if libc::WIFEXITED(event_msg) && !self.network_violation && !self.external_kill
                && !self.timed_out
            {
                self.core
                    .set_final_status(FinalStatus::Ok(libc::WEXITSTATUS(event_msg)));
            } else if libc::WIFSIGNALED(event_msg) {
                self.set_main_exit_status_by_cause(libc::WTERMSIG(event_msg));
            } else {
                self.set_main_exit_status_by_cause(libc::SIGKILL);
            }
            self.set_additional_result_info(regs);
        } else if log_stack_trace && self.core.stack_trace_collection_possible() {
            if let Err(err) = self.core.get_and_log_stack_trace(&regs) {
                error!("failed to get stack trace for PID {pid}: {err}");
            }
        }
        continue_process(pid, 0);
    }

    fn event_ptrace_stop(&mut self, pid: libc::pid_t, stopsig: libc::c_int) {
        // TRACECLONE and friends produce this event with SIGTRAP; only the
        // four job-control signals are real group-stops.
        if stopsig != libc::SIGSTOP
            && stopsig != libc::SIGTSTP
            && stopsig != libc::SIGTTIN
            && stopsig != libc::SIGTTOU
        {
            continue_process(pid, 0);
            return;
        }
        trace!("PID: {pid} group-stopped by {}", util::signal_name(stopsig));
        stop_process(pid);
    }

    /// After the main process is gone, give the rest of the tree a short
    /// window to be reaped; EXITKILL takes care of whoever remains.
    fn shutdown(&mut self) {
        if self.sandboxee_exited {
            return;
        }

        let log_stack_traces = self.core.result.final_status() != FinalStatus::Unset
            && !matches!(self.core.result.final_status(), FinalStatus::Ok(_))
            && self.core.options.log_all_stack_traces;

        if !log_stack_traces {
            // Make sure the main pid is killed and reaped.
            sigkill_process(self.main_pid());
        }

        let timeout = if log_stack_traces {
            self.core.options.stack_traces_collection_timeout
        } else {
            GRACEFUL_EXIT_TIMEOUT
        };
        let deadline = Instant::now() + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                info!("waiting for sandboxee exit timed out");
                break;
            }
            let left = deadline - now;

            let (pid, status) = match self.pid_waiter.wait() {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    let _ = sys_signal::sigtimedwait(&self.sset, left);
                    continue;
                }
                Err(errno) => {
                    if !(log_stack_traces && errno == Errno::CHILD) {
                        warn!("waitpid() failed during shutdown: {errno}");
                    }
                    break;
                }
            };

            if !log_stack_traces
                && pid == self.main_pid()
                && (libc::WIFSIGNALED(status) || libc::WIFEXITED(status))
            {
                break;
            }

            if libc::WIFSTOPPED(status) {
                if log_stack_traces {
                    self.log_stack_trace_of_pid(pid);
                }
                if wait_event(status) == libc::PTRACE_EVENT_EXIT {
                    trace!("PID: {pid} PTRACE_EVENT_EXIT during shutdown");
                    continue_process(pid, 0);
                    continue;
                }
                // Don't leave the straggler hanging in its stop.
                continue_process(pid, 0);
            }

            if !log_stack_traces {
                sigkill_process(self.main_pid());
            }
        }
    }

    fn log_stack_trace_of_pid(&mut self, pid: libc::pid_t) {
        if !self.core.stack_trace_collection_possible() {
            return;
        }
        let mut regs = Regs::new(pid);
        if let Err(err) = regs.fetch() {
            error!("failed to get regs, PID: {pid}: {err}");
            return;
        }
        if let Err(err) = self.core.get_and_log_stack_trace(&regs) {
            error!("failed to get stack trace, PID: {pid}: {err}");
        }
    }
}

fn is_clone_family(nr: i64) -> bool {
    let mut is_family = nr == libc::SYS_clone || nr == libc::SYS_clone3;
    #[cfg(target_arch = "x86_64")]
    {
        is_family = is_family || nr == libc::SYS_fork || nr == libc::SYS_vfork;
    }
    is_family
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::Comms;
    use crate::executor::SandboxeeProcess;
    use crate::notify::DenyAllNotify;

    #[test]
    fn clone_family_membership() {
        assert!(is_clone_family(libc::SYS_clone));
        assert!(is_clone_family(libc::SYS_clone3));
        assert!(!is_clone_family(libc::SYS_execve));
    }

    /// A loop over this test process itself: enough state to drive event
    /// handlers directly, without any forked sandboxee behind it.
    fn test_loop() -> PtraceLoop {
        let (comms, _peer) = Comms::socketpair().unwrap();
        let shared = Arc::new(MonitorShared::new());
        let core = MonitorCore {
            executor: Executor::new("/bin/true", &[]),
            policy: Policy::builder()
                .collect_stacktrace_on_violation(false)
                .build(),
            notify: Box::new(DenyAllNotify),
            options: MonitorOptions::default(),
            process: SandboxeeProcess {
                init_pid: None,
                main_pid: std::process::id() as libc::pid_t,
            },
            comms,
            result: SandboxResult::default(),
            log_file: None,
            shared,
        };
        PtraceLoop::new(core)
    }

    fn compat_arch() -> CpuArch {
        if CpuArch::host() == CpuArch::X8664 {
            CpuArch::X86
        } else {
            CpuArch::Arm
        }
    }

    #[test]
    fn arch_switch_violation_sets_arch_switch_status() {
        let mut monitor_loop = test_loop();
        let pid = monitor_loop.main_pid();
        let nr = 4242u64;
        let syscall = Syscall::new(compat_arch(), nr, [0; 6], pid, 0, 0);
        let mut regs = Regs::new(pid);

        monitor_loop.action_process_syscall_violation(
            &mut regs,
            &syscall,
            ViolationType::ArchitectureSwitch,
        );

        assert_eq!(
            monitor_loop.core.result.final_status(),
            FinalStatus::Violation(Violation::ArchSwitch(nr))
        );
        assert_eq!(monitor_loop.core.result.reason_code(), nr as i64);
        let recorded = monitor_loop.core.result.syscall().unwrap();
        assert_eq!(recorded.arch(), compat_arch());
        assert_eq!(recorded.nr(), nr);
        // The violation also snapshots the offender's context.
        assert!(monitor_loop.core.result.regs().is_some());
        assert!(monitor_loop.core.result.proc_maps().is_some());

        // First write wins: a later cause does not reattribute the death.
        monitor_loop.core.set_final_status(FinalStatus::Timeout);
        assert_eq!(
            monitor_loop.core.result.final_status(),
            FinalStatus::Violation(Violation::ArchSwitch(nr))
        );
    }

    #[test]
    fn denied_syscall_violation_keeps_syscall_kind() {
        let mut monitor_loop = test_loop();
        let pid = monitor_loop.main_pid();
        let nr = libc::SYS_socket as u64;
        let syscall = Syscall::new(CpuArch::host(), nr, [0; 6], pid, 0, 0);
        let mut regs = Regs::new(pid);

        monitor_loop.action_process_syscall_violation(&mut regs, &syscall, ViolationType::Syscall);

        assert_eq!(
            monitor_loop.core.result.final_status(),
            FinalStatus::Violation(Violation::Syscall(nr))
        );
    }

    #[test]
    fn out_of_range_seccomp_tag_is_ignored() {
        let mut monitor_loop = test_loop();
        let pid = monitor_loop.main_pid();
        // A raced exit status (code << 8) sits far outside the architecture
        // tag range; the event is dropped and no result is produced.
        monitor_loop.event_ptrace_seccomp(pid, 0x4200);
        assert_eq!(
            monitor_loop.core.result.final_status(),
            FinalStatus::Unset
        );
    }
}
