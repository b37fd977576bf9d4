//! Small /proc and signal helpers shared across the monitor.

use std::collections::HashSet;
use std::io;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::result::MonitorRusage;

/// Full `/proc/<pid>/maps` content. The whole file, not an iterator: the
/// result wants it verbatim and the symbolizer re-parses it anyway.
pub fn read_proc_maps(pid: libc::pid_t) -> io::Result<String> {
    std::fs::read_to_string(format!("/proc/{pid}/maps"))
}

/// Thread ids of a process, from `/proc/<pid>/task`.
pub fn list_tasks(pid: libc::pid_t) -> io::Result<HashSet<libc::pid_t>> {
    let mut tasks = HashSet::new();
    for entry in std::fs::read_dir(format!("/proc/{pid}/task"))? {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<libc::pid_t>() {
            tasks.insert(tid);
        }
    }
    Ok(tasks)
}

/// Name of the binary behind a pid, best effort.
pub fn prog_name(pid: libc::pid_t) -> String {
    std::fs::read_link(format!("/proc/{pid}/exe"))
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|_| {
            std::fs::read_to_string(format!("/proc/{pid}/comm")).map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|_| String::from("unknown"))
}

/// One line of `/proc/<pid>/status`, e.g. `status_line(pid, "Tgid")`.
pub fn proc_status_line(pid: libc::pid_t, key: &str) -> Option<String> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    content
        .lines()
        .find(|line| line.starts_with(key) && line[key.len()..].starts_with(':'))
        .map(|line| line[key.len() + 1..].trim().to_string())
}

pub fn signal_name(signo: i32) -> String {
    match signo {
        libc::SIGHUP => "SIGHUP".into(),
        libc::SIGINT => "SIGINT".into(),
        libc::SIGQUIT => "SIGQUIT".into(),
        libc::SIGILL => "SIGILL".into(),
        libc::SIGTRAP => "SIGTRAP".into(),
        libc::SIGABRT => "SIGABRT".into(),
        libc::SIGBUS => "SIGBUS".into(),
        libc::SIGFPE => "SIGFPE".into(),
        libc::SIGKILL => "SIGKILL".into(),
        libc::SIGUSR1 => "SIGUSR1".into(),
        libc::SIGSEGV => "SIGSEGV".into(),
        libc::SIGUSR2 => "SIGUSR2".into(),
        libc::SIGPIPE => "SIGPIPE".into(),
        libc::SIGALRM => "SIGALRM".into(),
        libc::SIGTERM => "SIGTERM".into(),
        libc::SIGCHLD => "SIGCHLD".into(),
        libc::SIGCONT => "SIGCONT".into(),
        libc::SIGSTOP => "SIGSTOP".into(),
        libc::SIGTSTP => "SIGTSTP".into(),
        libc::SIGTTIN => "SIGTTIN".into(),
        libc::SIGTTOU => "SIGTTOU".into(),
        libc::SIGXCPU => "SIGXCPU".into(),
        libc::SIGXFSZ => "SIGXFSZ".into(),
        libc::SIGVTALRM => "SIGVTALRM".into(),
        libc::SIGPROF => "SIGPROF".into(),
        libc::SIGSYS => "SIGSYS".into(),
        other => format!("signal {other}"),
    }
}

pub fn ptrace_event_name(event: i32) -> &'static str {
    match event {
        libc::PTRACE_EVENT_FORK => "PTRACE_EVENT_FORK",
        libc::PTRACE_EVENT_VFORK => "PTRACE_EVENT_VFORK",
        libc::PTRACE_EVENT_CLONE => "PTRACE_EVENT_CLONE",
        libc::PTRACE_EVENT_EXEC => "PTRACE_EVENT_EXEC",
        libc::PTRACE_EVENT_VFORK_DONE => "PTRACE_EVENT_VFORK_DONE",
        libc::PTRACE_EVENT_EXIT => "PTRACE_EVENT_EXIT",
        libc::PTRACE_EVENT_SECCOMP => "PTRACE_EVENT_SECCOMP",
        libc::PTRACE_EVENT_STOP => "PTRACE_EVENT_STOP",
        _ => "PTRACE_EVENT_UNKNOWN",
    }
}

/// Resource usage of the calling thread.
pub fn thread_rusage() -> MonitorRusage {
    // SAFETY: rusage is written by the kernel before use.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrusage(libc::RUSAGE_THREAD, &mut usage) };
    if ret != 0 {
        return MonitorRusage::default();
    }
    let us = |tv: libc::timeval| tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64;
    MonitorRusage {
        user_time_us: us(usage.ru_utime),
        system_time_us: us(usage.ru_stime),
        max_rss_kb: usage.ru_maxrss as u64,
    }
}

/// One-shot event: notified once, observable forever after.
#[derive(Default)]
pub struct Notification {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl Notification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut notified = self.state.lock().unwrap();
        *notified = true;
        self.condvar.notify_all();
    }

    pub fn has_been_notified(&self) -> bool {
        *self.state.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut notified = self.state.lock().unwrap();
        while !*notified {
            notified = self.condvar.wait(notified).unwrap();
        }
    }

    /// Returns false if the timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut notified = self.state.lock().unwrap();
        while !*notified {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.condvar.wait_timeout(notified, deadline - now).unwrap();
            notified = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_own_tasks() {
        let tasks = list_tasks(std::process::id() as libc::pid_t).unwrap();
        assert!(tasks.contains(&(std::process::id() as libc::pid_t)));
    }

    #[test]
    fn reads_own_maps() {
        let maps = read_proc_maps(std::process::id() as libc::pid_t).unwrap();
        assert!(maps.contains("r-xp") || maps.contains("r-x"));
    }

    #[test]
    fn status_line_lookup() {
        let pid = std::process::id() as libc::pid_t;
        let tgid = proc_status_line(pid, "Tgid").unwrap();
        assert_eq!(tgid, pid.to_string());
    }

    #[test]
    fn notification_wait_timeout_expires() {
        let notification = Notification::new();
        assert!(!notification.wait_timeout(Duration::from_millis(10)));
        notification.notify();
        assert!(notification.wait_timeout(Duration::from_millis(10)));
        assert!(notification.has_been_notified());
    }

    #[test]
    fn signal_names() {
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(250), "signal 250");
    }
}
