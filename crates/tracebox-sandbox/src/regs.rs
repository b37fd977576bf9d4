//! Per-task register access over ptrace.
//!
//! A `Regs` is a buffered copy of one task's general-purpose registers
//! (`NT_PRSTATUS`). Fetch it at a ptrace stop, inspect or rewrite it, store
//! it back. All architecture-specific register naming is confined here.

use std::mem;

use rustix::io::Errno;
use thiserror::Error;
use tracebox_sys::ptrace;

use crate::arch::CpuArch;
use crate::syscall::Syscall;

#[derive(Debug, Error)]
pub enum RegsError {
    /// The task disappeared mid-operation; callers log and carry on, the
    /// exit event is already on its way.
    #[error("process {0} not found")]
    NotFound(libc::pid_t),

    #[error("ptrace regset failed: {0}")]
    Ptrace(Errno),
}

impl RegsError {
    fn from_errno(pid: libc::pid_t, errno: Errno) -> Self {
        if errno == Errno::SRCH {
            RegsError::NotFound(pid)
        } else {
            RegsError::Ptrace(errno)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegsError::NotFound(_))
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
type UserRegs = libc::user_regs_struct;

#[derive(Debug, Clone, Copy)]
pub struct Regs {
    pid: libc::pid_t,
    regs: UserRegs,
}

impl Regs {
    pub fn new(pid: libc::pid_t) -> Self {
        Self {
            pid,
            // SAFETY: all-zero is a valid bit pattern for a plain register file.
            regs: unsafe { mem::zeroed() },
        }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Reads the full NT_PRSTATUS set from the stopped task.
    pub fn fetch(&mut self) -> Result<(), RegsError> {
        // SAFETY: UserRegs is the kernel's NT_PRSTATUS layout for this target.
        self.regs = unsafe { ptrace::get_regset::<UserRegs>(self.pid, ptrace::NT_PRSTATUS) }
            .map_err(|e| RegsError::from_errno(self.pid, e))?;
        Ok(())
    }

    /// Writes the buffered registers back.
    pub fn store(&self) -> Result<(), RegsError> {
        // SAFETY: same layout argument as fetch().
        unsafe { ptrace::set_regset(self.pid, ptrace::NT_PRSTATUS, &self.regs) }
            .map_err(|e| RegsError::from_errno(self.pid, e))
    }

    /// Rewrites the pending syscall to number -1 and plants `errno_val`
    /// (a negative errno, e.g. `-ENOSYS`) as its return value.
    #[cfg(target_arch = "x86_64")]
    pub fn skip_syscall_return_value(&mut self, errno_val: i64) -> Result<(), RegsError> {
        self.regs.orig_rax = -1i64 as u64;
        self.regs.rax = errno_val as u64;
        self.store()
    }

    #[cfg(target_arch = "aarch64")]
    pub fn skip_syscall_return_value(&mut self, errno_val: i64) -> Result<(), RegsError> {
        // The syscall number is not writable through NT_PRSTATUS on arm64.
        let nr: libc::c_int = -1;
        // SAFETY: NT_ARM_SYSTEM_CALL is exactly one c_int.
        unsafe { ptrace::set_regset(self.pid, ptrace::NT_ARM_SYSTEM_CALL, &nr) }
            .map_err(|e| RegsError::from_errno(self.pid, e))?;
        self.regs.regs[0] = errno_val as u64;
        self.store()
    }

    /// Packages the register file as a syscall record under `arch`'s calling
    /// convention.
    #[cfg(target_arch = "x86_64")]
    pub fn to_syscall(&self, arch: CpuArch) -> Syscall {
        let r = &self.regs;
        let args = if arch == CpuArch::X86 {
            // i386 compat convention on an x86_64 kernel.
            [r.rbx, r.rcx, r.rdx, r.rsi, r.rdi, r.rbp]
        } else {
            [r.rdi, r.rsi, r.rdx, r.r10, r.r8, r.r9]
        };
        Syscall::new(arch, r.orig_rax, args, self.pid, r.rsp, r.rip)
    }

    #[cfg(target_arch = "aarch64")]
    pub fn to_syscall(&self, arch: CpuArch) -> Syscall {
        let r = &self.regs;
        let args = [r.regs[0], r.regs[1], r.regs[2], r.regs[3], r.regs[4], r.regs[5]];
        Syscall::new(arch, r.regs[8], args, self.pid, r.sp, r.pc)
    }

    /// The syscall return value register, as seen at a syscall-exit-stop.
    #[cfg(target_arch = "x86_64")]
    pub fn return_value(&self) -> i64 {
        self.regs.rax as i64
    }

    #[cfg(target_arch = "aarch64")]
    pub fn return_value(&self) -> i64 {
        self.regs.regs[0] as i64
    }

    #[cfg(target_arch = "x86_64")]
    pub fn instruction_pointer(&self) -> u64 {
        self.regs.rip
    }

    #[cfg(target_arch = "aarch64")]
    pub fn instruction_pointer(&self) -> u64 {
        self.regs.pc
    }

    #[cfg(target_arch = "x86_64")]
    pub fn frame_pointer(&self) -> u64 {
        self.regs.rbp
    }

    #[cfg(target_arch = "aarch64")]
    pub fn frame_pointer(&self) -> u64 {
        self.regs.regs[29]
    }

    /// Raw bytes of the register file, for shipping to the unwinder helper.
    pub fn to_bytes(&self) -> Vec<u8> {
        // SAFETY: UserRegs is repr(C) plain-old-data.
        unsafe {
            std::slice::from_raw_parts(
                (&self.regs as *const UserRegs).cast::<u8>(),
                mem::size_of::<UserRegs>(),
            )
        }
        .to_vec()
    }

    /// Rebuilds a register file shipped with [`Regs::to_bytes`]. `None` on a
    /// size mismatch (different layout on the other side).
    pub fn from_bytes(pid: libc::pid_t, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != mem::size_of::<UserRegs>() {
            return None;
        }
        // SAFETY: length checked; any bit pattern is a valid register file.
        let regs = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<UserRegs>()) };
        Some(Self { pid, regs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_on_missing_pid_is_not_found() {
        let mut regs = Regs::new(-4096);
        let err = regs.fetch().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn bytes_round_trip() {
        let regs = Regs::new(42);
        let bytes = regs.to_bytes();
        let back = Regs::from_bytes(42, &bytes).unwrap();
        assert_eq!(back.instruction_pointer(), regs.instruction_pointer());
        assert_eq!(back.frame_pointer(), regs.frame_pointer());
    }

    #[test]
    fn from_bytes_rejects_bad_length() {
        assert!(Regs::from_bytes(1, &[0u8; 3]).is_none());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn compat_syscall_uses_i386_convention() {
        let mut regs = Regs::new(1);
        regs.regs.orig_rax = libc::SYS_getpid as u64;
        regs.regs.rbx = 11;
        regs.regs.rdi = 99;
        let native = regs.to_syscall(CpuArch::X8664);
        let compat = regs.to_syscall(CpuArch::X86);
        assert_eq!(native.args()[0], 99);
        assert_eq!(compat.args()[0], 11);
    }
}
