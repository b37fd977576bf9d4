//! Signal-set plumbing for the monitor's wait loop.
//!
//! The monitor parks in `sigtimedwait` on a SIGCHLD-only mask between
//! `waitpid(WNOHANG)` sweeps. Neither rustix nor nix expose `sigtimedwait`
//! with a timeout, so it lives here.

use std::time::Duration;

use rustix::io::Errno;

use crate::last_errno;

/// Builds a sigset containing exactly the given signals.
pub fn sigset_of(signals: &[libc::c_int]) -> libc::sigset_t {
    // SAFETY: sigemptyset initializes the set before any use.
    unsafe {
        let mut set = std::mem::zeroed::<libc::sigset_t>();
        libc::sigemptyset(&mut set);
        for &sig in signals {
            libc::sigaddset(&mut set, sig);
        }
        set
    }
}

/// Blocks the given set on the calling thread. Signals in the set are then
/// only observable through [`sigtimedwait`].
pub fn block_on_current_thread(set: &libc::sigset_t) -> Result<(), Errno> {
    // SAFETY: set is a valid initialized sigset.
    let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, set, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(Errno::from_raw_os_error(ret));
    }
    Ok(())
}

/// Waits up to `timeout` for one of the signals in `set`.
///
/// Returns the signal number, or `Err(EAGAIN)` on timeout.
pub fn sigtimedwait(set: &libc::sigset_t, timeout: Duration) -> Result<libc::c_int, Errno> {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // SAFETY: set and ts are valid for the duration of the call.
    let ret = unsafe { libc::sigtimedwait(set, std::ptr::null_mut(), &ts) };
    if ret == -1 { Err(last_errno()) } else { Ok(ret) }
}

/// Directs `signo` at a specific thread of this process.
pub fn kill_thread(thread: libc::pthread_t, signo: libc::c_int) -> Result<(), Errno> {
    // SAFETY: pthread_kill validates the handle.
    let ret = unsafe { libc::pthread_kill(thread, signo) };
    if ret != 0 {
        return Err(Errno::from_raw_os_error(ret));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigtimedwait_times_out() {
        let set = sigset_of(&[libc::SIGCHLD]);
        block_on_current_thread(&set).unwrap();
        let err = sigtimedwait(&set, Duration::from_millis(10)).unwrap_err();
        assert_eq!(err, Errno::AGAIN);
    }

    #[test]
    fn sigtimedwait_sees_self_directed_signal() {
        let set = sigset_of(&[libc::SIGCHLD]);
        block_on_current_thread(&set).unwrap();
        kill_thread(unsafe { libc::pthread_self() }, libc::SIGCHLD).unwrap();
        let sig = sigtimedwait(&set, Duration::from_secs(1)).unwrap();
        assert_eq!(sig, libc::SIGCHLD);
    }
}
