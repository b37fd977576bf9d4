//! Architecture-tagged syscall records.
//!
//! A `Syscall` is an immutable snapshot taken at a seccomp stop: the ABI it
//! was issued under, the number, the six argument registers, and where the
//! task was executing. It exists for diagnostics; the monitor never
//! interprets arguments itself.

use std::fmt;

use crate::arch::CpuArch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Syscall {
    arch: CpuArch,
    nr: u64,
    args: [u64; 6],
    pid: libc::pid_t,
    sp: u64,
    ip: u64,
}

impl Syscall {
    pub fn new(arch: CpuArch, nr: u64, args: [u64; 6], pid: libc::pid_t, sp: u64, ip: u64) -> Self {
        Self {
            arch,
            nr,
            args,
            pid,
            sp,
            ip,
        }
    }

    pub fn arch(&self) -> CpuArch {
        self.arch
    }

    pub fn nr(&self) -> u64 {
        self.nr
    }

    pub fn args(&self) -> &[u64; 6] {
        &self.args
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn sp(&self) -> u64 {
        self.sp
    }

    pub fn ip(&self) -> u64 {
        self.ip
    }

    /// The syscall's name under its own ABI, or `UNKNOWN[nr/0xnr]`.
    pub fn name(&self) -> String {
        match syscall_name(self.arch, self.nr) {
            Some(name) => name.to_string(),
            None => format!("UNKNOWN[{}/0x{:x}]", self.nr, self.nr),
        }
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}](",
            self.arch.description(),
            self.name(),
            self.nr
        )?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg:#x}")?;
        }
        write!(f, ") IP: {:#x}, STACK: {:#x}", self.ip, self.sp)
    }
}

/// Name lookup, host ABI only: a foreign-arch number would name the wrong
/// syscall, so anything non-host is reported numerically.
pub fn syscall_name(arch: CpuArch, nr: u64) -> Option<&'static str> {
    if arch != CpuArch::host() {
        return None;
    }
    host_syscall_name(nr as i64)
}

fn host_syscall_name(nr: i64) -> Option<&'static str> {
    #[cfg(target_arch = "x86_64")]
    {
        // Legacy syscalls that newer ABIs dropped.
        match nr {
            libc::SYS_open => return Some("open"),
            libc::SYS_stat => return Some("stat"),
            libc::SYS_lstat => return Some("lstat"),
            libc::SYS_access => return Some("access"),
            libc::SYS_pipe => return Some("pipe"),
            libc::SYS_select => return Some("select"),
            libc::SYS_poll => return Some("poll"),
            libc::SYS_dup2 => return Some("dup2"),
            libc::SYS_fork => return Some("fork"),
            libc::SYS_vfork => return Some("vfork"),
            libc::SYS_unlink => return Some("unlink"),
            libc::SYS_readlink => return Some("readlink"),
            libc::SYS_mkdir => return Some("mkdir"),
            libc::SYS_rmdir => return Some("rmdir"),
            libc::SYS_rename => return Some("rename"),
            libc::SYS_creat => return Some("creat"),
            libc::SYS_chmod => return Some("chmod"),
            libc::SYS_chown => return Some("chown"),
            libc::SYS_alarm => return Some("alarm"),
            libc::SYS_getpgrp => return Some("getpgrp"),
            libc::SYS_arch_prctl => return Some("arch_prctl"),
            libc::SYS_time => return Some("time"),
            libc::SYS_symlink => return Some("symlink"),
            libc::SYS_link => return Some("link"),
            _ => {}
        }
    }
    match nr {
        libc::SYS_read => Some("read"),
        libc::SYS_write => Some("write"),
        libc::SYS_close => Some("close"),
        libc::SYS_fstat => Some("fstat"),
        libc::SYS_lseek => Some("lseek"),
        libc::SYS_mmap => Some("mmap"),
        libc::SYS_mprotect => Some("mprotect"),
        libc::SYS_munmap => Some("munmap"),
        libc::SYS_brk => Some("brk"),
        libc::SYS_rt_sigaction => Some("rt_sigaction"),
        libc::SYS_rt_sigprocmask => Some("rt_sigprocmask"),
        libc::SYS_rt_sigreturn => Some("rt_sigreturn"),
        libc::SYS_ioctl => Some("ioctl"),
        libc::SYS_pread64 => Some("pread64"),
        libc::SYS_pwrite64 => Some("pwrite64"),
        libc::SYS_readv => Some("readv"),
        libc::SYS_writev => Some("writev"),
        libc::SYS_sched_yield => Some("sched_yield"),
        libc::SYS_mremap => Some("mremap"),
        libc::SYS_msync => Some("msync"),
        libc::SYS_mincore => Some("mincore"),
        libc::SYS_madvise => Some("madvise"),
        libc::SYS_dup => Some("dup"),
        libc::SYS_dup3 => Some("dup3"),
        libc::SYS_nanosleep => Some("nanosleep"),
        libc::SYS_getpid => Some("getpid"),
        libc::SYS_socket => Some("socket"),
        libc::SYS_connect => Some("connect"),
        libc::SYS_accept => Some("accept"),
        libc::SYS_sendto => Some("sendto"),
        libc::SYS_recvfrom => Some("recvfrom"),
        libc::SYS_sendmsg => Some("sendmsg"),
        libc::SYS_recvmsg => Some("recvmsg"),
        libc::SYS_shutdown => Some("shutdown"),
        libc::SYS_bind => Some("bind"),
        libc::SYS_listen => Some("listen"),
        libc::SYS_getsockname => Some("getsockname"),
        libc::SYS_getpeername => Some("getpeername"),
        libc::SYS_socketpair => Some("socketpair"),
        libc::SYS_setsockopt => Some("setsockopt"),
        libc::SYS_getsockopt => Some("getsockopt"),
        libc::SYS_clone => Some("clone"),
        libc::SYS_clone3 => Some("clone3"),
        libc::SYS_execve => Some("execve"),
        libc::SYS_execveat => Some("execveat"),
        libc::SYS_exit => Some("exit"),
        libc::SYS_exit_group => Some("exit_group"),
        libc::SYS_wait4 => Some("wait4"),
        libc::SYS_waitid => Some("waitid"),
        libc::SYS_kill => Some("kill"),
        libc::SYS_tkill => Some("tkill"),
        libc::SYS_tgkill => Some("tgkill"),
        libc::SYS_uname => Some("uname"),
        libc::SYS_fcntl => Some("fcntl"),
        libc::SYS_flock => Some("flock"),
        libc::SYS_fsync => Some("fsync"),
        libc::SYS_fdatasync => Some("fdatasync"),
        libc::SYS_truncate => Some("truncate"),
        libc::SYS_ftruncate => Some("ftruncate"),
        libc::SYS_getdents64 => Some("getdents64"),
        libc::SYS_getcwd => Some("getcwd"),
        libc::SYS_chdir => Some("chdir"),
        libc::SYS_fchdir => Some("fchdir"),
        libc::SYS_mkdirat => Some("mkdirat"),
        libc::SYS_unlinkat => Some("unlinkat"),
        libc::SYS_renameat => Some("renameat"),
        libc::SYS_renameat2 => Some("renameat2"),
        libc::SYS_linkat => Some("linkat"),
        libc::SYS_symlinkat => Some("symlinkat"),
        libc::SYS_readlinkat => Some("readlinkat"),
        libc::SYS_fchmod => Some("fchmod"),
        libc::SYS_fchmodat => Some("fchmodat"),
        libc::SYS_fchown => Some("fchown"),
        libc::SYS_fchownat => Some("fchownat"),
        libc::SYS_umask => Some("umask"),
        libc::SYS_gettimeofday => Some("gettimeofday"),
        libc::SYS_getrlimit => Some("getrlimit"),
        libc::SYS_getrusage => Some("getrusage"),
        libc::SYS_sysinfo => Some("sysinfo"),
        libc::SYS_times => Some("times"),
        libc::SYS_ptrace => Some("ptrace"),
        libc::SYS_getuid => Some("getuid"),
        libc::SYS_getgid => Some("getgid"),
        libc::SYS_geteuid => Some("geteuid"),
        libc::SYS_getegid => Some("getegid"),
        libc::SYS_getppid => Some("getppid"),
        libc::SYS_gettid => Some("gettid"),
        libc::SYS_futex => Some("futex"),
        libc::SYS_set_tid_address => Some("set_tid_address"),
        libc::SYS_set_robust_list => Some("set_robust_list"),
        libc::SYS_get_robust_list => Some("get_robust_list"),
        libc::SYS_clock_gettime => Some("clock_gettime"),
        libc::SYS_clock_getres => Some("clock_getres"),
        libc::SYS_clock_nanosleep => Some("clock_nanosleep"),
        libc::SYS_sched_getaffinity => Some("sched_getaffinity"),
        libc::SYS_sched_setaffinity => Some("sched_setaffinity"),
        libc::SYS_prctl => Some("prctl"),
        libc::SYS_prlimit64 => Some("prlimit64"),
        libc::SYS_openat => Some("openat"),
        libc::SYS_newfstatat => Some("newfstatat"),
        libc::SYS_faccessat => Some("faccessat"),
        libc::SYS_faccessat2 => Some("faccessat2"),
        libc::SYS_pipe2 => Some("pipe2"),
        libc::SYS_ppoll => Some("ppoll"),
        libc::SYS_pselect6 => Some("pselect6"),
        libc::SYS_epoll_create1 => Some("epoll_create1"),
        libc::SYS_epoll_ctl => Some("epoll_ctl"),
        libc::SYS_epoll_pwait => Some("epoll_pwait"),
        libc::SYS_eventfd2 => Some("eventfd2"),
        libc::SYS_getrandom => Some("getrandom"),
        libc::SYS_memfd_create => Some("memfd_create"),
        libc::SYS_statx => Some("statx"),
        libc::SYS_rseq => Some("rseq"),
        libc::SYS_close_range => Some("close_range"),
        libc::SYS_copy_file_range => Some("copy_file_range"),
        libc::SYS_utimensat => Some("utimensat"),
        libc::SYS_sigaltstack => Some("sigaltstack"),
        libc::SYS_seccomp => Some("seccomp"),
        libc::SYS_bpf => Some("bpf"),
        libc::SYS_setpriority => Some("setpriority"),
        libc::SYS_getpriority => Some("getpriority"),
        libc::SYS_sendfile => Some("sendfile"),
        libc::SYS_splice => Some("splice"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_known_syscalls() {
        assert_eq!(syscall_name(CpuArch::host(), libc::SYS_write as u64), Some("write"));
        assert_eq!(
            syscall_name(CpuArch::host(), libc::SYS_exit_group as u64),
            Some("exit_group")
        );
    }

    #[test]
    fn foreign_arch_is_numeric() {
        let foreign = if CpuArch::host() == CpuArch::X8664 {
            CpuArch::Arm64
        } else {
            CpuArch::X8664
        };
        assert_eq!(syscall_name(foreign, libc::SYS_write as u64), None);
    }

    #[test]
    fn description_contains_name_and_registers() {
        let syscall = Syscall::new(
            CpuArch::host(),
            libc::SYS_write as u64,
            [1, 0xdead, 4, 0, 0, 0],
            1234,
            0x7ffc_0000,
            0x40_1000,
        );
        let text = syscall.to_string();
        assert!(text.contains("write"), "{text}");
        assert!(text.contains("0xdead"), "{text}");
        assert!(text.contains("IP: 0x401000"), "{text}");
    }

    #[test]
    fn unknown_nr_is_numeric() {
        let syscall = Syscall::new(CpuArch::host(), 99_999, [0; 6], 1, 0, 0);
        assert!(syscall.name().starts_with("UNKNOWN[99999/0x1869f"));
    }
}
