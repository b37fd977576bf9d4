//! Run a command under the monitor and print what happened.
//!
//! ```sh
//! cargo run --example trace_tool -- /bin/ls /
//! ```
//!
//! Every syscall outside the startup allowlist is traced, logged and
//! allowed, so this doubles as a crude policy-authoring aid: the log shows
//! what a real policy for the target would need.

use std::time::Duration;

use anyhow::bail;
use tracebox_sandbox::notify::PermitAndLogNotify;
use tracebox_sandbox::{Executor, Policy, Sandbox};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        bail!("usage: trace_tool <program> [args...]");
    }
    let argv: Vec<&str> = args.iter().skip(1).map(String::as_str).collect();

    let mut executor = Executor::new(&args[0], &argv);
    executor
        .limits_mut()
        .set_wall_time_limit(Duration::from_secs(60));

    let policy = Policy::builder().allow_default_runtime().build();
    let mut sandbox = Sandbox::with_notify(executor, policy, Box::new(PermitAndLogNotify));

    let result = sandbox.run();
    println!("result: {result}");
    if !result.stack_trace().is_empty() {
        println!("stack trace:");
        for frame in result.stack_trace() {
            println!("  {frame}");
        }
    }

    if !matches!(result.final_status(), tracebox_sandbox::FinalStatus::Ok(0)) {
        std::process::exit(1);
    }
    Ok(())
}
