//! Stack capture at (or near) sandboxee death.
//!
//! By default the unwinder runs in a freshly forked helper process: it
//! parses maps and ELF files of — and chases frame pointers through — memory
//! the sandboxee controlled, and none of that parsing is trusted in the
//! monitor process. The monitor ships `UnwindSetup` plus a `/proc/<pid>/mem`
//! fd over a private comms pair and reads back the frame strings, with a
//! hard deadline and a SIGKILL for a helper that stops answering.
//!
//! `MonitorOptions::sandboxed_unwinder = false` short-circuits all of that
//! and unwinds in-process, which is how the monitor thread (the tracer) can
//! use the libunwind driver directly.

use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use log::warn;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracebox_sys::ptrace as sys_ptrace;

use crate::comms::{Comms, CommsError};
use crate::config::MonitorOptions;
use crate::regs::Regs;
use crate::unwind::{self, RemoteMemory, UnwindError, UnwindSetup};

/// Wall-clock budget for the whole helper conversation.
const HELPER_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StackTraceError {
    #[error("stack traces are disabled")]
    Disabled,

    #[error("unwind: {0}")]
    Unwind(#[from] UnwindError),

    #[error("comms: {0}")]
    Comms(#[from] CommsError),

    #[error("fork: {0}")]
    Fork(rustix::io::Errno),

    #[error("unwinder helper: {0}")]
    Helper(String),

    #[error("unwinder helper timed out")]
    HelperTimeout,
}

/// Captures and symbolizes the stack of the (stopped) process behind `regs`.
pub fn collect(regs: &Regs, options: &MonitorOptions) -> Result<Vec<String>, StackTraceError> {
    if options.disable_stack_traces {
        return Err(StackTraceError::Disabled);
    }

    if !options.sandboxed_unwinder {
        warn!("using the in-process unwinder");
        let mem = RemoteMemory::open(regs.pid())?;
        return Ok(unwind::run_unwind_and_symbolize(
            regs.pid(),
            regs,
            &mem,
            unwind::DEFAULT_MAX_FRAMES,
        )?);
    }

    collect_via_helper(regs)
}

fn collect_via_helper(regs: &Regs) -> Result<Vec<String>, StackTraceError> {
    let pid = regs.pid();
    // Opened before the fork: the helper itself has no business holding
    // /proc permissions, only this one fd.
    let mem = RemoteMemory::open(pid).map_err(StackTraceError::Unwind)?;

    let (mut monitor_comms, mut helper_comms) =
        Comms::socketpair().map_err(CommsError::Io)?;

    // SAFETY: the helper only talks over its comms end and exits.
    let helper_pid = unsafe { libc::fork() };
    match helper_pid {
        -1 => Err(StackTraceError::Fork(tracebox_sys::last_errno())),
        0 => {
            drop(monitor_comms);
            let ok = unwind::serve_unwind_request(&mut helper_comms);
            // SAFETY: child exit without unwinding the monitor's state.
            unsafe { libc::_exit(if ok { 0 } else { 1 }) }
        }
        _ => {
            drop(helper_comms);
            let outcome = drive_helper(&mut monitor_comms, regs, &mem, helper_pid);
            reap_helper(helper_pid, outcome.is_err());
            outcome
        }
    }
}

fn drive_helper(
    comms: &mut Comms,
    regs: &Regs,
    mem: &RemoteMemory,
    helper_pid: libc::pid_t,
) -> Result<Vec<String>, StackTraceError> {
    let deadline = Instant::now() + HELPER_DEADLINE;

    let setup = UnwindSetup {
        pid: regs.pid(),
        max_frames: unwind::DEFAULT_MAX_FRAMES as u32,
        regs_bytes: regs.to_bytes(),
    };
    comms.send_bytes(&setup.encode())?;
    comms.send_fd(mem.as_file().as_raw_fd())?;

    wait_readable(comms.as_raw_fd(), deadline, helper_pid)?;
    comms
        .recv_status()?
        .map_err(StackTraceError::Helper)?;

    wait_readable(comms.as_raw_fd(), deadline, helper_pid)?;
    Ok(comms.recv_strings()?)
}

/// Polls the comms fd until readable; on deadline the helper is killed and
/// the collection reported as timed out.
fn wait_readable(
    fd: libc::c_int,
    deadline: Instant,
    helper_pid: libc::pid_t,
) -> Result<(), StackTraceError> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            let _ = signal::kill(Pid::from_raw(helper_pid), Signal::SIGKILL);
            return Err(StackTraceError::HelperTimeout);
        }
        let timeout_ms = (deadline - now).as_millis().min(i32::MAX as u128) as libc::c_int;
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is valid for the duration of the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret > 0 {
            return Ok(());
        }
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            let _ = signal::kill(Pid::from_raw(helper_pid), Signal::SIGKILL);
            return Err(StackTraceError::Helper(format!("poll: {err}")));
        }
    }
}

fn reap_helper(helper_pid: libc::pid_t, kill_first: bool) {
    if kill_first {
        let _ = signal::kill(Pid::from_raw(helper_pid), Signal::SIGKILL);
    }
    if let Err(errno) = sys_ptrace::waitpid(helper_pid, 0) {
        warn!("reaping unwinder helper {helper_pid} failed: {errno}");
    }
}

/// Folds runs of identical frames into a repeat marker. Deep recursion turns
/// into two lines instead of two hundred.
pub fn compact_stack_trace(stack_trace: &[String]) -> Vec<String> {
    let mut compact = Vec::with_capacity(stack_trace.len() / 2 + 1);
    let mut repeats = 0usize;
    let add_repeats = |compact: &mut Vec<String>, repeats: usize| {
        if repeats != 0 {
            compact.push(format!("(previous frame repeated {repeats} times)"));
        }
    };
    let mut prev: Option<&String> = None;
    for frame in stack_trace {
        if prev == Some(frame) {
            repeats += 1;
        } else {
            add_repeats(&mut compact, repeats);
            repeats = 0;
            compact.push(frame.clone());
            prev = Some(frame);
        }
    }
    add_repeats(&mut compact, repeats);
    compact
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn compact_keeps_distinct_frames() {
        let trace = frames(&["a", "b", "c"]);
        assert_eq!(compact_stack_trace(&trace), trace);
    }

    #[test]
    fn compact_folds_runs() {
        let trace = frames(&["a", "recurse", "recurse", "recurse", "b"]);
        assert_eq!(
            compact_stack_trace(&trace),
            frames(&["a", "recurse", "(previous frame repeated 2 times)", "b"])
        );
    }

    #[test]
    fn compact_folds_trailing_run() {
        let trace = frames(&["x", "x"]);
        assert_eq!(
            compact_stack_trace(&trace),
            frames(&["x", "(previous frame repeated 1 times)"])
        );
    }

    #[test]
    fn compact_empty() {
        assert!(compact_stack_trace(&[]).is_empty());
    }

    #[test]
    fn disabled_options_short_circuit() {
        let options = MonitorOptions {
            disable_stack_traces: true,
            ..MonitorOptions::default()
        };
        let regs = Regs::new(1);
        assert!(matches!(
            collect(&regs, &options),
            Err(StackTraceError::Disabled)
        ));
    }

    #[test]
    fn helper_collects_own_stack() {
        // Unwinding this test process: regs are zeroed (fp == 0), so the
        // trace is just the zero ip frame, but the whole helper round trip
        // (fork, fd pass, symbolize, reap) must succeed.
        let pid = std::process::id() as libc::pid_t;
        let regs = Regs::new(pid);
        let options = MonitorOptions::default();
        let trace = collect(&regs, &options).unwrap();
        assert_eq!(trace.len(), 1);
        assert!(trace[0].ends_with("(0x0)"), "{:?}", trace);
    }
}
