//! Compiled sandbox policy.
//!
//! A `Policy` is what the monitor consumes: a ready-to-install BPF program
//! whose default verdict is `SECCOMP_RET_TRACE`, plus the per-outcome
//! stack-trace collection switches. Building rich policies (path rules,
//! argument matching) is out of scope here; the builder covers allowlists
//! and the trace-everything default, which together with a [`crate::Notify`]
//! implementation is a complete enforcement surface.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracebox_sys::seccomp::{SockFilter, build_trace_filter};

use crate::arch::CpuArch;

/// Connection-policy status shared with an external network proxy. The
/// proxy thread flips the flag; the monitor kills the sandboxee and
/// attributes the death to the network violation.
#[derive(Debug, Default)]
pub struct NetworkProxyStatus {
    violation: AtomicBool,
    message: Mutex<String>,
}

impl NetworkProxyStatus {
    pub fn report_violation(&self, message: impl Into<String>) {
        *self.message.lock().unwrap() = message.into();
        self.violation.store(true, Ordering::Release);
    }

    pub fn violation_occurred(&self) -> bool {
        self.violation.load(Ordering::Acquire)
    }

    pub fn violation_message(&self) -> String {
        self.message.lock().unwrap().clone()
    }
}

#[derive(Debug)]
pub struct Policy {
    filter: Vec<SockFilter>,
    pub collect_stacktrace_on_violation: bool,
    pub collect_stacktrace_on_signal: bool,
    pub collect_stacktrace_on_timeout: bool,
    pub collect_stacktrace_on_kill: bool,
    pub collect_stacktrace_on_exit: bool,
    network_proxy: Option<std::sync::Arc<NetworkProxyStatus>>,
}

impl Policy {
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::new()
    }

    /// The BPF program to ship to the client.
    pub fn filter(&self) -> &[SockFilter] {
        &self.filter
    }

    pub fn network_proxy(&self) -> Option<&std::sync::Arc<NetworkProxyStatus>> {
        self.network_proxy.as_ref()
    }
}

pub struct PolicyBuilder {
    allowed: Vec<i64>,
    collect_stacktrace_on_violation: bool,
    collect_stacktrace_on_signal: bool,
    collect_stacktrace_on_timeout: bool,
    collect_stacktrace_on_kill: bool,
    collect_stacktrace_on_exit: bool,
    network_proxy: Option<std::sync::Arc<NetworkProxyStatus>>,
}

impl Default for PolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self {
            allowed: Vec::new(),
            collect_stacktrace_on_violation: true,
            collect_stacktrace_on_signal: true,
            collect_stacktrace_on_timeout: true,
            collect_stacktrace_on_kill: true,
            collect_stacktrace_on_exit: false,
            network_proxy: None,
        }
    }

    /// Allow a syscall outright: it will never reach the monitor.
    pub fn allow_syscall(mut self, nr: i64) -> Self {
        if !self.allowed.contains(&nr) {
            self.allowed.push(nr);
        }
        self
    }

    pub fn allow_syscalls(mut self, nrs: impl IntoIterator<Item = i64>) -> Self {
        for nr in nrs {
            self = self.allow_syscall(nr);
        }
        self
    }

    /// Drop a syscall from the allowlist again, so it reaches the monitor.
    /// Handy for policies built on [`PolicyBuilder::allow_default_runtime`].
    pub fn deny_syscall(mut self, nr: i64) -> Self {
        self.allowed.retain(|&allowed| allowed != nr);
        self
    }

    /// The syscalls any dynamically linked binary needs to reach `main` and
    /// exit: program loading, memory, stdio, thread bookkeeping.
    pub fn allow_default_runtime(self) -> Self {
        let mut nrs = vec![
            libc::SYS_read,
            libc::SYS_write,
            libc::SYS_close,
            libc::SYS_fstat,
            libc::SYS_lseek,
            libc::SYS_mmap,
            libc::SYS_mprotect,
            libc::SYS_munmap,
            libc::SYS_brk,
            libc::SYS_rt_sigaction,
            libc::SYS_rt_sigprocmask,
            libc::SYS_rt_sigreturn,
            libc::SYS_pread64,
            libc::SYS_openat,
            libc::SYS_newfstatat,
            libc::SYS_getrandom,
            libc::SYS_set_tid_address,
            libc::SYS_set_robust_list,
            libc::SYS_rseq,
            libc::SYS_prlimit64,
            libc::SYS_futex,
            libc::SYS_sched_getaffinity,
            libc::SYS_getpid,
            libc::SYS_gettid,
            libc::SYS_exit,
            libc::SYS_exit_group,
            libc::SYS_sigaltstack,
            libc::SYS_clock_gettime,
            libc::SYS_clock_nanosleep,
            libc::SYS_nanosleep,
            libc::SYS_getcwd,
            libc::SYS_readlinkat,
            libc::SYS_faccessat,
            libc::SYS_ioctl,
            libc::SYS_writev,
            libc::SYS_dup,
            libc::SYS_fcntl,
            libc::SYS_getuid,
            libc::SYS_getgid,
            libc::SYS_geteuid,
            libc::SYS_getegid,
            libc::SYS_getppid,
            libc::SYS_uname,
            libc::SYS_execve,
        ];
        #[cfg(target_arch = "x86_64")]
        nrs.extend([
            libc::SYS_access,
            libc::SYS_stat,
            libc::SYS_arch_prctl,
            libc::SYS_readlink,
            libc::SYS_poll,
        ]);
        self.allow_syscalls(nrs)
    }

    pub fn collect_stacktrace_on_violation(mut self, value: bool) -> Self {
        self.collect_stacktrace_on_violation = value;
        self
    }

    pub fn collect_stacktrace_on_signal(mut self, value: bool) -> Self {
        self.collect_stacktrace_on_signal = value;
        self
    }

    pub fn collect_stacktrace_on_timeout(mut self, value: bool) -> Self {
        self.collect_stacktrace_on_timeout = value;
        self
    }

    pub fn collect_stacktrace_on_kill(mut self, value: bool) -> Self {
        self.collect_stacktrace_on_kill = value;
        self
    }

    pub fn collect_stacktrace_on_exit(mut self, value: bool) -> Self {
        self.collect_stacktrace_on_exit = value;
        self
    }

    pub fn network_proxy(mut self, status: std::sync::Arc<NetworkProxyStatus>) -> Self {
        self.network_proxy = Some(status);
        self
    }

    pub fn build(self) -> Policy {
        let spec = CpuArch::host_filter_spec(&self.allowed);
        Policy {
            filter: build_trace_filter(&spec),
            collect_stacktrace_on_violation: self.collect_stacktrace_on_violation,
            collect_stacktrace_on_signal: self.collect_stacktrace_on_signal,
            collect_stacktrace_on_timeout: self.collect_stacktrace_on_timeout,
            collect_stacktrace_on_kill: self.collect_stacktrace_on_kill,
            collect_stacktrace_on_exit: self.collect_stacktrace_on_exit,
            network_proxy: self.network_proxy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_everything_policy_has_filter() {
        let policy = Policy::builder().build();
        assert!(!policy.filter().is_empty());
    }

    #[test]
    fn allowlist_dedups() {
        let policy = Policy::builder()
            .allow_syscall(libc::SYS_write)
            .allow_syscall(libc::SYS_write)
            .build();
        let baseline = Policy::builder().allow_syscall(libc::SYS_write).build();
        assert_eq!(policy.filter().len(), baseline.filter().len());
    }

    #[test]
    fn deny_removes_from_allowlist() {
        let with_write = Policy::builder().allow_default_runtime().build();
        let without_write = Policy::builder()
            .allow_default_runtime()
            .deny_syscall(libc::SYS_write)
            .build();
        assert_eq!(with_write.filter().len(), without_write.filter().len() + 1);
    }

    #[test]
    fn network_proxy_status_reports() {
        let status = NetworkProxyStatus::default();
        assert!(!status.violation_occurred());
        status.report_violation("connect to 10.0.0.1:443 denied");
        assert!(status.violation_occurred());
        assert!(status.violation_message().contains("10.0.0.1"));
    }
}
