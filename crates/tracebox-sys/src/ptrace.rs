//! ptrace requests used by the monitor.
//!
//! libc exposes `ptrace()` as a variadic function; these wrappers pin down
//! the argument shapes the monitor actually uses and translate failures into
//! `rustix::io::Errno`. Register sets go through `PTRACE_GETREGSET` /
//! `PTRACE_SETREGSET` with an explicit iovec so the kernel tells us how much
//! it filled in.

use std::mem;

use rustix::io::Errno;

use crate::last_errno;

/// NT_PRSTATUS regset: the general-purpose registers.
pub const NT_PRSTATUS: libc::c_int = 1;

/// NT_ARM_SYSTEM_CALL regset: the syscall number on aarch64, which is not
/// writable through NT_PRSTATUS.
pub const NT_ARM_SYSTEM_CALL: libc::c_int = 0x404;

/// The full option set the monitor attaches with. EXITKILL makes monitor
/// death fatal to the tree; TRACESYSGOOD marks syscall-exit-stops with
/// bit 7 of the stop signal.
pub const SEIZE_OPTIONS: libc::c_int = libc::PTRACE_O_TRACESYSGOOD
    | libc::PTRACE_O_TRACEFORK
    | libc::PTRACE_O_TRACEVFORK
    | libc::PTRACE_O_TRACEVFORKDONE
    | libc::PTRACE_O_TRACECLONE
    | libc::PTRACE_O_TRACEEXEC
    | libc::PTRACE_O_TRACEEXIT
    | libc::PTRACE_O_TRACESECCOMP
    | libc::PTRACE_O_EXITKILL;

/// Extracts the ptrace event from a waitpid status. Not wrapped by glibc.
#[inline]
pub const fn wait_event(status: libc::c_int) -> libc::c_int {
    (status >> 16) & 0xff
}

/// The stop signal reported for a syscall-exit-stop under TRACESYSGOOD.
pub const SYSCALL_EXIT_SIG: libc::c_int = libc::SIGTRAP | 0x80;

#[inline]
fn ptrace_result(ret: libc::c_long) -> Result<(), Errno> {
    if ret == -1 { Err(last_errno()) } else { Ok(()) }
}

/// `PTRACE_SEIZE` with the given option bits. Does not stop the target.
pub fn seize(pid: libc::pid_t, options: libc::c_int) -> Result<(), Errno> {
    // SAFETY: SEIZE takes no address/data pointers beyond the option bits.
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_SEIZE,
            pid as libc::c_long,
            0 as libc::c_long,
            options as libc::c_long,
        )
    })
}

/// `PTRACE_CONT`, delivering `signo` (0 for none) to the tracee.
pub fn cont(pid: libc::pid_t, signo: libc::c_int) -> Result<(), Errno> {
    // SAFETY: no pointers involved.
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_CONT,
            pid as libc::c_long,
            0 as libc::c_long,
            signo as libc::c_long,
        )
    })
}

/// `PTRACE_LISTEN`: leave a group-stopped tracee stopped but reachable.
pub fn listen(pid: libc::pid_t) -> Result<(), Errno> {
    // SAFETY: no pointers involved.
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_LISTEN,
            pid as libc::c_long,
            0 as libc::c_long,
            0 as libc::c_long,
        )
    })
}

/// `PTRACE_SYSCALL`: continue until the next syscall-entry or -exit stop.
pub fn syscall(pid: libc::pid_t, signo: libc::c_int) -> Result<(), Errno> {
    // SAFETY: no pointers involved.
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_SYSCALL,
            pid as libc::c_long,
            0 as libc::c_long,
            signo as libc::c_long,
        )
    })
}

/// `PTRACE_INTERRUPT`: stop a SEIZEd tracee.
pub fn interrupt(pid: libc::pid_t) -> Result<(), Errno> {
    // SAFETY: no pointers involved.
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_INTERRUPT,
            pid as libc::c_long,
            0 as libc::c_long,
            0 as libc::c_long,
        )
    })
}

/// `PTRACE_GETEVENTMSG`: the datum attached to the last ptrace event stop
/// (new child's pid, exit status, or the seccomp RET_DATA).
pub fn get_event_msg(pid: libc::pid_t) -> Result<u64, Errno> {
    let mut msg: libc::c_ulong = 0;
    // SAFETY: msg outlives the call and matches the expected c_ulong.
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_GETEVENTMSG,
            pid as libc::c_long,
            0 as libc::c_long,
            &mut msg as *mut libc::c_ulong,
        )
    })?;
    Ok(msg as u64)
}

/// Reads a regset into `T`.
///
/// # Safety
///
/// `T` must match the kernel's layout for the requested regset on this
/// architecture (e.g. `libc::user_regs_struct` for `NT_PRSTATUS`).
pub unsafe fn get_regset<T>(pid: libc::pid_t, set: libc::c_int) -> Result<T, Errno> {
    let mut regs = mem::MaybeUninit::<T>::uninit();
    let mut iov = libc::iovec {
        iov_base: regs.as_mut_ptr().cast(),
        iov_len: mem::size_of::<T>(),
    };
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid as libc::c_long,
            set as libc::c_long,
            &mut iov as *mut libc::iovec,
        )
    })?;
    if iov.iov_len != mem::size_of::<T>() {
        return Err(Errno::INVAL);
    }
    Ok(unsafe { regs.assume_init() })
}

/// Writes a regset from `T`.
///
/// # Safety
///
/// Same layout requirement as [`get_regset`].
pub unsafe fn set_regset<T>(pid: libc::pid_t, set: libc::c_int, regs: &T) -> Result<(), Errno> {
    let mut iov = libc::iovec {
        iov_base: (regs as *const T).cast_mut().cast(),
        iov_len: mem::size_of::<T>(),
    };
    ptrace_result(unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid as libc::c_long,
            set as libc::c_long,
            &mut iov as *mut libc::iovec,
        )
    })
}

/// `PTRACE_PEEKDATA`: one word of tracee memory. The -1-with-errno dance is
/// needed because -1 is also a valid word.
pub fn peek_data(pid: libc::pid_t, addr: u64) -> Result<u64, Errno> {
    // SAFETY: errno is cleared first so a -1 return can be disambiguated.
    unsafe {
        *libc::__errno_location() = 0;
        let word = libc::ptrace(
            libc::PTRACE_PEEKDATA,
            pid as libc::c_long,
            addr as libc::c_long,
            0 as libc::c_long,
        );
        let errno = *libc::__errno_location();
        if word == -1 && errno != 0 {
            return Err(Errno::from_raw_os_error(errno));
        }
        Ok(word as u64)
    }
}

/// Raw `waitpid`. Returns `Ok(None)` when WNOHANG found nothing ready.
pub fn waitpid(pid: libc::pid_t, flags: libc::c_int) -> Result<Option<(libc::pid_t, libc::c_int)>, Errno> {
    let mut status: libc::c_int = 0;
    // SAFETY: status outlives the call.
    let ret = unsafe { libc::waitpid(pid, &mut status, flags) };
    match ret {
        -1 => Err(last_errno()),
        0 => Ok(None),
        child => Ok(Some((child, status))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_event_extraction() {
        // PTRACE_EVENT_EXIT (6) shifted into bits 16..24 of a SIGTRAP stop.
        let status = (libc::PTRACE_EVENT_EXIT << 16) | (libc::SIGTRAP << 8) | 0x7f;
        assert_eq!(wait_event(status), libc::PTRACE_EVENT_EXIT);
        assert!(libc::WIFSTOPPED(status));
        assert_eq!(libc::WSTOPSIG(status), libc::SIGTRAP);
    }

    #[test]
    fn syscall_exit_sig_has_bit7() {
        assert_eq!(SYSCALL_EXIT_SIG & 0x80, 0x80);
        assert_eq!(SYSCALL_EXIT_SIG & 0x7f, libc::SIGTRAP);
    }

    #[test]
    fn peek_data_reports_esrch_for_dead_pid() {
        // PID 1 exists but we are not its tracer; a wildly invalid pid is ESRCH.
        let err = peek_data(-4096, 0).unwrap_err();
        assert_eq!(err, rustix::io::Errno::SRCH);
    }
}
