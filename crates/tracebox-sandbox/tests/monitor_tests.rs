//! End-to-end monitor behavior against real sandboxees.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{AllowAllNotify, InspectNotify, host_binary, init_logging, runtime_policy, sh};
use tracebox_sandbox::policy::NetworkProxyStatus;
use tracebox_sandbox::{Executor, FinalStatus, Policy, Sandbox, Violation};

const AWAIT_BUDGET: Duration = Duration::from_secs(20);

fn await_done(sandbox: &mut Sandbox) -> tracebox_sandbox::SandboxResult {
    sandbox
        .await_result_with_timeout(AWAIT_BUDGET)
        .expect("sandbox did not finish in time")
}

#[test]
fn normal_exit_reports_exit_code() {
    init_logging();
    let mut sandbox = Sandbox::with_notify(
        sh("exit 7"),
        runtime_policy().build(),
        Box::new(AllowAllNotify),
    );
    let result = sandbox.run();
    assert_eq!(result.final_status(), FinalStatus::Ok(7));
    assert_eq!(result.reason_code(), 7);
}

#[test]
fn abort_reports_signaled_sigabrt() {
    init_logging();
    // Core dumps are off (RLIMIT_CORE = 0 by default), abort is a plain
    // signal death.
    let mut sandbox = Sandbox::with_notify(
        sh("kill -ABRT $$"),
        runtime_policy().build(),
        Box::new(AllowAllNotify),
    );
    let result = sandbox.run();
    assert_eq!(result.final_status(), FinalStatus::Signaled(libc::SIGABRT));
    assert_eq!(result.reason_code(), i64::from(libc::SIGABRT));
}

#[test]
fn walltime_limit_reports_timeout() {
    init_logging();
    let mut executor = Executor::new(host_binary("sleep"), &["10"]);
    executor
        .limits_mut()
        .set_wall_time_limit(Duration::from_secs(1));
    let mut sandbox = Sandbox::with_notify(
        executor,
        runtime_policy().collect_stacktrace_on_timeout(false).build(),
        Box::new(AllowAllNotify),
    );
    let result = sandbox.run();
    assert_eq!(result.final_status(), FinalStatus::Timeout);
    assert!(result.stack_trace().is_empty());
}

#[test]
fn walltime_limit_can_be_armed_late() {
    init_logging();
    let mut sandbox = Sandbox::with_notify(
        Executor::new(host_binary("sleep"), &["10"]),
        runtime_policy().collect_stacktrace_on_timeout(false).build(),
        Box::new(AllowAllNotify),
    );
    assert!(sandbox.run_async());
    sandbox.set_walltime_limit(Duration::from_secs(1));
    let result = await_done(&mut sandbox);
    assert_eq!(result.final_status(), FinalStatus::Timeout);
}

#[test]
fn external_kill_reports_external_kill() {
    init_logging();
    let mut sandbox = Sandbox::with_notify(
        Executor::new(host_binary("sleep"), &["10"]),
        runtime_policy().collect_stacktrace_on_kill(false).build(),
        Box::new(AllowAllNotify),
    );
    assert!(sandbox.run_async());
    std::thread::sleep(Duration::from_millis(200));
    sandbox.kill();
    let result = await_done(&mut sandbox);
    assert_eq!(result.final_status(), FinalStatus::ExternalKill);
    assert_eq!(result.reason_code(), 0);
    assert!(result.stack_trace().is_empty());
}

#[test]
fn kill_is_idempotent() {
    init_logging();
    let mut sandbox = Sandbox::with_notify(
        Executor::new(host_binary("sleep"), &["10"]),
        runtime_policy().collect_stacktrace_on_kill(false).build(),
        Box::new(AllowAllNotify),
    );
    assert!(sandbox.run_async());
    sandbox.kill();
    sandbox.kill();
    sandbox.kill();
    let first = await_done(&mut sandbox);
    let second = sandbox.await_result();
    assert_eq!(first.final_status(), FinalStatus::ExternalKill);
    assert_eq!(second.final_status(), first.final_status());
    assert_eq!(second.reason_code(), first.reason_code());
}

#[test]
fn denied_syscall_reports_violation() {
    init_logging();
    // Allow nothing, deny everything traced: the dynamic loader's very
    // first syscall after execve is the violation.
    let mut sandbox = Sandbox::new(host_true_executor(), Policy::builder().build());
    let result = sandbox.run();
    let FinalStatus::Violation(Violation::Syscall(nr)) = result.final_status() else {
        panic!("expected syscall violation, got {result}");
    };
    let syscall = result.syscall().expect("violation carries the syscall");
    assert_eq!(syscall.nr(), nr);
    assert_eq!(result.reason_code(), nr as i64);
    assert!(result.proc_maps().is_some());
    assert!(result.regs().is_some());
}

fn host_true_executor() -> Executor {
    Executor::new(host_binary("true"), &[])
}

#[test]
fn collect_stacktrace_on_exit_captures_frames() {
    init_logging();
    let mut sandbox = Sandbox::with_notify(
        host_true_executor(),
        runtime_policy().collect_stacktrace_on_exit(true).build(),
        Box::new(AllowAllNotify),
    );
    let result = sandbox.run();
    assert_eq!(result.final_status(), FinalStatus::Ok(0));
    assert!(!result.stack_trace().is_empty());
    assert!(result.proc_maps().is_some());
}

#[test]
fn inspect_after_return_sees_return_value() {
    init_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let notify = InspectNotify {
        inspect_nr: libc::SYS_write as u64,
        seen: Arc::clone(&seen),
    };
    // write must stay out of the allowlist so it reaches the notify handler.
    let policy = Policy::builder()
        .allow_default_runtime()
        .deny_syscall(libc::SYS_write)
        .build();
    let mut sandbox = Sandbox::with_notify(sh("echo tracebox-inspect"), policy, Box::new(notify));
    let result = sandbox.run();
    assert_eq!(result.final_status(), FinalStatus::Ok(0));

    let seen = seen.lock().unwrap();
    assert!(
        seen.iter()
            .any(|&(nr, rv)| nr == libc::SYS_write as u64 && rv > 0),
        "no successful write observed: {seen:?}"
    );
}

#[test]
fn network_proxy_violation_wins_attribution() {
    init_logging();
    let proxy = Arc::new(NetworkProxyStatus::default());
    let mut sandbox = Sandbox::with_notify(
        Executor::new(host_binary("sleep"), &["10"]),
        runtime_policy()
            .collect_stacktrace_on_violation(false)
            .network_proxy(Arc::clone(&proxy))
            .build(),
        Box::new(AllowAllNotify),
    );
    assert!(sandbox.run_async());
    std::thread::sleep(Duration::from_millis(200));
    proxy.report_violation("connect to 203.0.113.7:25 denied");
    let result = await_done(&mut sandbox);
    assert_eq!(
        result.final_status(),
        FinalStatus::Violation(Violation::Network)
    );
    assert!(
        result
            .network_violation()
            .is_some_and(|msg| msg.contains("203.0.113.7"))
    );
}

#[test]
fn missing_binary_is_a_setup_error() {
    init_logging();
    let mut sandbox = Sandbox::with_notify(
        Executor::new("/nonexistent/tracebox-target", &[]),
        runtime_policy().build(),
        Box::new(AllowAllNotify),
    );
    let result = sandbox.run();
    assert!(
        matches!(result.final_status(), FinalStatus::SetupError(_)),
        "expected setup error, got {result}"
    );
}

#[test]
fn dump_stack_request_does_not_disturb_the_run() {
    init_logging();
    let mut sandbox = Sandbox::with_notify(
        Executor::new(host_binary("sleep"), &["10"]),
        runtime_policy().collect_stacktrace_on_kill(false).build(),
        Box::new(AllowAllNotify),
    );
    assert!(sandbox.run_async());
    std::thread::sleep(Duration::from_millis(200));
    sandbox.dump_stack_trace();
    std::thread::sleep(Duration::from_millis(500));
    sandbox.kill();
    let result = await_done(&mut sandbox);
    assert_eq!(result.final_status(), FinalStatus::ExternalKill);
}

#[test]
fn busy_loop_still_times_out_promptly() {
    init_logging();
    // A sandboxee that never sleeps must not starve the deadline check.
    let mut executor = sh("while :; do :; done");
    executor
        .limits_mut()
        .set_wall_time_limit(Duration::from_secs(2));
    let mut sandbox = Sandbox::with_notify(
        executor,
        runtime_policy().collect_stacktrace_on_timeout(false).build(),
        Box::new(AllowAllNotify),
    );
    let start = Instant::now();
    let result = sandbox.run();
    assert_eq!(result.final_status(), FinalStatus::Timeout);
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "timeout took {:?}",
        start.elapsed()
    );
}

#[test]
fn child_process_storm_does_not_starve_the_main_exit() {
    init_logging();
    // Children hammer the monitor with events while the parent exits
    // quickly; the exit of the main pid must still be observed.
    let script = "for i in 1 2 3 4 5 6 7 8; do (exit 0) & done; wait; exit 11";
    let mut sandbox = Sandbox::with_notify(
        sh(script),
        runtime_policy().build(),
        Box::new(AllowAllNotify),
    );
    let result = sandbox.run();
    assert_eq!(result.final_status(), FinalStatus::Ok(11));
}

#[test]
fn monitor_rusage_is_recorded() {
    init_logging();
    let mut sandbox = Sandbox::with_notify(
        host_true_executor(),
        runtime_policy().build(),
        Box::new(AllowAllNotify),
    );
    let result = sandbox.run();
    assert_eq!(result.final_status(), FinalStatus::Ok(0));
    assert!(result.rusage_monitor().is_some());
}
