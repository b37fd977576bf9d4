//! Starvation-free reaping of a traced thread group.
//!
//! `waitpid` is biased towards newer threads, so a busy child storm can
//! starve the event that actually matters: the main process exiting. The
//! waiter drains a whole burst of ready statuses per refill and serves them
//! FIFO, polling the priority pid first each round so it always gets a slot.

use std::collections::VecDeque;

use rustix::io::Errno;
use tracebox_sys::ptrace;

/// waitpid flags for a ptrace monitor: non-blocking, all thread types, only
/// tasks this thread traces. glibc hides the double-underscore flags from
/// the wait header, hence the literals.
pub const WAIT_FLAGS: libc::c_int = libc::WNOHANG | libc::WUNTRACED | WAIT_ALL | WAIT_NOTHREAD;

const WAIT_ALL: libc::c_int = 0x4000_0000; // __WALL
const WAIT_NOTHREAD: libc::c_int = 0x2000_0000; // __WNOTHREAD

pub struct PidWaiter {
    priority_pid: libc::pid_t,
    statuses: VecDeque<(libc::pid_t, libc::c_int)>,
    last_errno: Option<Errno>,
}

impl PidWaiter {
    /// The given pid is checked first on every refill.
    pub fn new(priority_pid: libc::pid_t) -> Self {
        Self {
            priority_pid,
            statuses: VecDeque::new(),
            last_errno: None,
        }
    }

    /// One ready child at a time: `Ok(Some((pid, status)))`, `Ok(None)` when
    /// nothing needs attention right now, or the deferred `waitpid` error.
    pub fn wait(&mut self) -> Result<Option<(libc::pid_t, libc::c_int)>, Errno> {
        if self.statuses.is_empty() && self.last_errno.is_none() {
            self.refill();
        }

        if let Some(entry) = self.statuses.pop_front() {
            return Ok(Some(entry));
        }
        match self.last_errno.take() {
            Some(errno) => Err(errno),
            None => Ok(None),
        }
    }

    fn refill(&mut self) {
        self.statuses.clear();
        self.last_errno = None;
        let mut pid = self.priority_pid;
        loop {
            match ptrace::waitpid(pid, WAIT_FLAGS) {
                Ok(Some(entry)) => self.statuses.push_back(entry),
                Err(errno) => {
                    self.last_errno = Some(errno);
                    break;
                }
                Ok(None) => {
                    if pid == -1 {
                        break;
                    }
                }
            }
            pid = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fork_exiting_child(code: i32) -> libc::pid_t {
        // SAFETY: the child only calls _exit.
        match unsafe { libc::fork() } {
            0 => unsafe { libc::_exit(code) },
            pid => pid,
        }
    }

    fn wait_until_ready(waiter: &mut PidWaiter) -> (libc::pid_t, libc::c_int) {
        for _ in 0..200 {
            match waiter.wait() {
                Ok(Some(entry)) => return entry,
                Ok(None) => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(errno) => panic!("waitpid failed: {errno}"),
            }
        }
        panic!("no child became ready");
    }

    #[test]
    fn reaps_exited_child() {
        let pid = fork_exiting_child(7);
        let mut waiter = PidWaiter::new(pid);
        let (reaped, status) = wait_until_ready(&mut waiter);
        assert_eq!(reaped, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 7);
    }

    #[test]
    fn priority_pid_served_before_burst() {
        // Spawn noise children first so the kernel has plenty of ready
        // statuses, then the priority child; it must still come out first
        // once its exit is visible.
        let noise: Vec<_> = (0..8).map(|_| fork_exiting_child(0)).collect();
        let priority = fork_exiting_child(3);

        // Give every child time to exit before the first refill.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let mut waiter = PidWaiter::new(priority);
        let (first, status) = wait_until_ready(&mut waiter);
        assert_eq!(first, priority);
        assert_eq!(libc::WEXITSTATUS(status), 3);

        // The noise children are still all served.
        let mut seen = Vec::new();
        while seen.len() < noise.len() {
            match waiter.wait() {
                Ok(Some((pid, _))) => seen.push(pid),
                Ok(None) => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(_) => break,
            }
        }
        for pid in noise {
            assert!(seen.contains(&pid), "child {pid} never reaped");
        }
    }

    #[test]
    fn no_children_reports_echild() {
        let mut waiter = PidWaiter::new(999_999);
        match waiter.wait() {
            Err(errno) => assert_eq!(errno, Errno::CHILD),
            other => panic!("expected ECHILD, got {other:?}"),
        }
    }
}
