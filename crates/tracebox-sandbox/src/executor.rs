//! Starting the sandboxee.
//!
//! The `Executor` describes the target process and forks it. The child runs
//! the [`crate::client`] rendezvous and ends in `execve`; the parent gets a
//! [`SandboxeeProcess`] plus the monitor end of the comms channel.
//!
//! Namespace setup is not done here. When an outer layer prepares a PID
//! namespace, it reports the namespace root via `init_pid` and the monitor
//! seizes it too; without namespaces `init_pid` is absent.

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use log::info;
use rustix::io::Errno;
use thiserror::Error;
use tracebox_sys::last_errno;

use crate::client::{self, ClientSpec};
use crate::comms::Comms;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("socketpair: {0}")]
    Comms(std::io::Error),

    #[error("fork: {0}")]
    Fork(Errno),

    #[error("prlimit64({resource}): {errno}")]
    Limit { resource: &'static str, errno: Errno },
}

/// Resource limits applied to the sandboxee right before it is released.
#[derive(Debug, Clone)]
pub struct Limits {
    wall_time_limit: Duration,
    rlimit_as: u64,
    rlimit_cpu: u64,
    rlimit_fsize: u64,
    rlimit_nofile: u64,
    rlimit_core: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            // Zero means no wall-clock deadline.
            wall_time_limit: Duration::ZERO,
            rlimit_as: libc::RLIM_INFINITY,
            rlimit_cpu: libc::RLIM_INFINITY,
            rlimit_fsize: 8 * 1024 * 1024 * 1024,
            rlimit_nofile: 1024,
            rlimit_core: 0,
        }
    }
}

impl Limits {
    pub fn wall_time_limit(&self) -> Duration {
        self.wall_time_limit
    }

    pub fn set_wall_time_limit(&mut self, limit: Duration) -> &mut Self {
        self.wall_time_limit = limit;
        self
    }

    pub fn set_rlimit_as(&mut self, limit: u64) -> &mut Self {
        self.rlimit_as = limit;
        self
    }

    pub fn set_rlimit_cpu(&mut self, seconds: u64) -> &mut Self {
        self.rlimit_cpu = seconds;
        self
    }

    pub fn set_rlimit_fsize(&mut self, limit: u64) -> &mut Self {
        self.rlimit_fsize = limit;
        self
    }

    pub fn set_rlimit_nofile(&mut self, limit: u64) -> &mut Self {
        self.rlimit_nofile = limit;
        self
    }

    pub fn set_rlimit_core(&mut self, limit: u64) -> &mut Self {
        self.rlimit_core = limit;
        self
    }

    /// Applies each rlimit to `pid` via `prlimit64`. A requested soft limit
    /// above the target's hard limit is skipped rather than failed: the
    /// process keeps its stricter limit.
    pub fn apply_to(&self, pid: libc::pid_t) -> Result<(), ExecutorError> {
        let pairs: [(libc::c_int, u64, &'static str); 5] = [
            (libc::RLIMIT_AS as libc::c_int, self.rlimit_as, "RLIMIT_AS"),
            (libc::RLIMIT_CPU as libc::c_int, self.rlimit_cpu, "RLIMIT_CPU"),
            (libc::RLIMIT_FSIZE as libc::c_int, self.rlimit_fsize, "RLIMIT_FSIZE"),
            (libc::RLIMIT_NOFILE as libc::c_int, self.rlimit_nofile, "RLIMIT_NOFILE"),
            (libc::RLIMIT_CORE as libc::c_int, self.rlimit_core, "RLIMIT_CORE"),
        ];
        for (resource, value, name) in pairs {
            apply_one_limit(pid, resource, value, name)?;
        }
        Ok(())
    }
}

fn apply_one_limit(
    pid: libc::pid_t,
    resource: libc::c_int,
    value: u64,
    name: &'static str,
) -> Result<(), ExecutorError> {
    let mut current = libc::rlimit64 {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: current is written by the kernel on success.
    let ret = unsafe { libc::prlimit64(pid, resource as _, std::ptr::null(), &mut current) };
    if ret == 0 && value > current.rlim_max {
        info!("{name}: requested {value} > hard limit {}, keeping current", current.rlim_max);
        return Ok(());
    }

    let wanted = libc::rlimit64 {
        rlim_cur: value,
        rlim_max: value,
    };
    // SAFETY: wanted outlives the call.
    let ret = unsafe { libc::prlimit64(pid, resource as _, &wanted, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(ExecutorError::Limit {
            resource: name,
            errno: last_errno(),
        });
    }
    Ok(())
}

/// The forked sandboxee pair: the optional PID-namespace init and the
/// process the caller cares about.
#[derive(Debug, Clone, Copy)]
pub struct SandboxeeProcess {
    pub init_pid: Option<libc::pid_t>,
    pub main_pid: libc::pid_t,
}

#[derive(Debug)]
pub struct Executor {
    path: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    limits: Limits,
    enable_sandboxing_pre_execve: bool,
    libunwind_sbox_for_pid: libc::pid_t,
}

impl Executor {
    pub fn new(path: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            path: path.into(),
            args: args.iter().map(|s| (*s).to_string()).collect(),
            env: Vec::new(),
            cwd: None,
            limits: Limits::default(),
            enable_sandboxing_pre_execve: true,
            libunwind_sbox_for_pid: 0,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn limits_mut(&mut self) -> &mut Limits {
        &mut self.limits
    }

    /// When false, the monitor treats the sandboxee as enforced from the
    /// first instruction instead of waiting for the execve event.
    pub fn set_enable_sandbox_before_exec(&mut self, value: bool) -> &mut Self {
        self.enable_sandboxing_pre_execve = value;
        self
    }

    pub fn enable_sandboxing_pre_execve(&self) -> bool {
        self.enable_sandboxing_pre_execve
    }

    /// Non-zero marks this executor as the unwinder helper for the given
    /// target pid; the monitor then never tries to capture ITS stack, which
    /// would recurse.
    pub fn set_libunwind_sbox_for_pid(&mut self, pid: libc::pid_t) -> &mut Self {
        self.libunwind_sbox_for_pid = pid;
        self
    }

    pub fn libunwind_sbox_for_pid(&self) -> libc::pid_t {
        self.libunwind_sbox_for_pid
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Forks the sandboxee. The child enters the client rendezvous and never
    /// returns; the parent gets the pids and the monitor end of comms.
    pub(crate) fn start_subprocess(&self) -> Result<(SandboxeeProcess, Comms), ExecutorError> {
        let (monitor_comms, child_comms) = Comms::socketpair().map_err(ExecutorError::Comms)?;

        let spec = ClientSpec {
            path: self.path.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
        };

        // SAFETY: the child only calls async-signal-unsafe functions before
        // any other thread of this process has been observed locking; the
        // monitor thread is spawned after this returns.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(ExecutorError::Fork(last_errno())),
            0 => {
                drop(monitor_comms);
                let err = client::run(child_comms, &spec);
                // Reached only when setup or execve failed.
                let _ = writeln!(std::io::stderr(), "sandboxee setup: {err}");
                // SAFETY: terminating the forked child without unwinding.
                unsafe { libc::_exit(126) }
            }
            child => {
                drop(child_comms);
                info!("forked sandboxee PID: {child} ({})", self.path.display());
                Ok((
                    SandboxeeProcess {
                        init_pid: None,
                        main_pid: child,
                    },
                    monitor_comms,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_defaults() {
        let limits = Limits::default();
        assert_eq!(limits.wall_time_limit(), Duration::ZERO);
        assert_eq!(limits.rlimit_core, 0);
    }

    #[test]
    fn apply_to_self_respects_hard_limit() {
        // Requesting more open files than the hard limit must not fail.
        let mut limits = Limits::default();
        limits.set_rlimit_nofile(u64::MAX / 2);
        limits.apply_to(0).unwrap();
    }

    #[test]
    fn executor_builder() {
        let mut executor = Executor::new("/bin/true", &[]).env("KEY", "value");
        executor.limits_mut().set_wall_time_limit(Duration::from_secs(5));
        assert!(executor.enable_sandboxing_pre_execve());
        assert_eq!(executor.limits().wall_time_limit(), Duration::from_secs(5));
    }
}
