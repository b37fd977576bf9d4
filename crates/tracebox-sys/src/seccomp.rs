//! Seccomp-BPF filters built for tracing, not killing.
//!
//! The monitor wants every syscall it has not explicitly allowed to stop the
//! task with `SECCOMP_RET_TRACE` so the tracer can decide. The 16-bit
//! `SECCOMP_RET_DATA` carries an architecture tag: the BPF program can see
//! the audit architecture of the calling thread, the tracer cannot (not
//! without fetching registers first), so the filter smuggles it through the
//! event message.
//!
//! ## Filter Layout
//!
//! ```text
//! [0]        Load audit arch
//! [1]        host arch    -> load syscall nr
//! [2..2+m]   compat arch  -> RET TRACE | compat tag
//! [2+m]      unknown arch -> RET TRACE | unknown tag
//! [..]       m compat TRACE returns
//! [..]       Load syscall nr
//! [..+n]     allowlist checks -> ALLOW
//! [..]       RET TRACE | host tag   (default)
//! [..]       RET ALLOW
//! ```

use rustix::io::Errno;

use crate::last_errno;

const SECCOMP_SET_MODE_FILTER: u32 = 1;
const SECCOMP_FILTER_FLAG_TSYNC: u32 = 1;

const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

// BPF instruction classes and fields
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

// seccomp_data offsets
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;

/// Maximum allowlist size (BPF jump offsets are u8).
const MAX_ALLOWLIST_SIZE: usize = 200;

pub const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;
pub const AUDIT_ARCH_I386: u32 = 0x4000_0003;
pub const AUDIT_ARCH_AARCH64: u32 = 0xc000_00b7;
pub const AUDIT_ARCH_ARM: u32 = 0x4000_0028;
pub const AUDIT_ARCH_PPC64LE: u32 = 0xc000_0015;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    #[inline]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    #[inline]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct SockFprog {
    pub len: u16,
    pub filter: *const SockFilter,
}

/// What the trace filter should emit for each architecture it can see.
///
/// `host` syscalls fall through to the allowlist; anything arriving under a
/// `compat` or unrecognized audit arch is traced immediately with the
/// corresponding tag, before the syscall number is even looked at.
#[derive(Debug, Clone, Copy)]
pub struct TraceFilterSpec<'a> {
    pub host_audit_arch: u32,
    pub host_tag: u16,
    pub unknown_tag: u16,
    /// (audit arch, tag) pairs for compat modes reachable on this host.
    pub compat: &'a [(u32, u16)],
    /// Syscall numbers that bypass tracing entirely.
    pub allowed: &'a [i64],
}

#[inline]
const fn ret_trace(tag: u16) -> SockFilter {
    SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_TRACE | (tag as u32 & SECCOMP_RET_DATA))
}

/// Builds the trace filter described by `spec`.
///
/// # Panics
///
/// Panics if `spec.allowed.len()` > 200 (BPF jump offsets are u8).
pub fn build_trace_filter(spec: &TraceFilterSpec) -> Vec<SockFilter> {
    assert!(
        spec.allowed.len() <= MAX_ALLOWLIST_SIZE,
        "allowlist too large: {} > {} (BPF jump offset overflow)",
        spec.allowed.len(),
        MAX_ALLOWLIST_SIZE
    );

    let m = spec.compat.len();
    let n = spec.allowed.len();
    let mut filter = Vec::with_capacity(2 * m + n + 6);

    // Architecture dispatch.
    filter.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
    // Host arch jumps over the compat returns to the nr load.
    filter.push(SockFilter::jump(
        BPF_JMP | BPF_JEQ | BPF_K,
        spec.host_audit_arch,
        (2 * m + 1) as u8,
        0,
    ));
    // Each compat arch jumps to its own TRACE return, m instructions ahead.
    for &(audit, _) in spec.compat {
        filter.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, audit, m as u8, 0));
    }
    filter.push(ret_trace(spec.unknown_tag));
    for &(_, tag) in spec.compat {
        filter.push(ret_trace(tag));
    }

    // Host path: allowlist, then trace-by-default.
    filter.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_SYSCALL_NR));
    for (i, &nr) in spec.allowed.iter().enumerate() {
        filter.push(SockFilter::jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            nr as u32,
            (n - i) as u8,
            0,
        ));
    }
    filter.push(ret_trace(spec.host_tag));
    filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));

    filter
}

/// Applies a seccomp-BPF filter to the whole thread group.
///
/// Sets `PR_SET_NO_NEW_PRIVS` first, then installs with
/// `SECCOMP_FILTER_FLAG_TSYNC` so threads spawned before the filter are
/// covered too (Linux 3.17; TSYNC-less fallback is not attempted).
///
/// # Safety
///
/// This permanently restricts syscalls for the calling process. The filter
/// must be a valid BPF program.
pub unsafe fn seccomp_set_mode_filter_tsync(fprog: &SockFprog) -> Result<(), Errno> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(last_errno());
    }

    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            SECCOMP_FILTER_FLAG_TSYNC,
            fprog as *const _,
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Returns true if seccomp is available.
pub fn seccomp_available() -> bool {
    unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) >= 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec<'a>(compat: &'a [(u32, u16)], allowed: &'a [i64]) -> TraceFilterSpec<'a> {
        TraceFilterSpec {
            host_audit_arch: AUDIT_ARCH_X86_64,
            host_tag: 1,
            unknown_tag: 0,
            compat,
            allowed,
        }
    }

    #[test]
    fn trace_everything_filter_structure() {
        let filter = build_trace_filter(&spec(&[], &[]));
        // ld arch + host jeq + unknown trace + ld nr + default trace + allow
        assert_eq!(filter.len(), 6);
        assert_eq!(filter[4], ret_trace(1));
        assert_eq!(filter[5].k, SECCOMP_RET_ALLOW);
    }

    #[test]
    fn compat_arch_traced_before_nr_load() {
        let compat = [(AUDIT_ARCH_I386, 2u16)];
        let filter = build_trace_filter(&spec(&compat, &[libc::SYS_exit_group]));
        // Compat check sits right after the host check and jumps to its
        // dedicated TRACE return.
        assert_eq!(filter[2].k, AUDIT_ARCH_I386);
        let target = 2 + 1 + filter[2].jt as usize;
        assert_eq!(filter[target], ret_trace(2));
    }

    #[test]
    fn allowlist_jumps_land_on_allow() {
        let allowed = [libc::SYS_read, libc::SYS_write, libc::SYS_exit_group];
        let filter = build_trace_filter(&spec(&[], &allowed));
        let allow_idx = filter.len() - 1;
        assert_eq!(filter[allow_idx].k, SECCOMP_RET_ALLOW);
        // First allowlist check is at index 4 (ld arch, host jeq, unknown
        // trace, ld nr); every check must land exactly on the ALLOW slot.
        for (i, _) in allowed.iter().enumerate() {
            let idx = 4 + i;
            assert_eq!(filter[idx].k, allowed[i] as u32);
            assert_eq!(idx + 1 + filter[idx].jt as usize, allow_idx);
        }
    }

    #[test]
    fn host_jump_lands_on_nr_load() {
        let compat = [(AUDIT_ARCH_I386, 2u16), (AUDIT_ARCH_ARM, 4u16)];
        let filter = build_trace_filter(&spec(&compat, &[]));
        let target = 1 + 1 + filter[1].jt as usize;
        assert_eq!(filter[target], SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_SYSCALL_NR));
    }

    #[test]
    #[should_panic(expected = "allowlist too large")]
    fn allowlist_overflow_panics() {
        let huge: Vec<i64> = (0..300).collect();
        build_trace_filter(&spec(&[], &huge));
    }
}
