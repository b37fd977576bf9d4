//! Syscall architecture tags.
//!
//! The seccomp filter returns one of these tags in `SECCOMP_RET_DATA`, so a
//! seccomp event tells the monitor which ABI issued the syscall before any
//! registers are fetched. The numeric values travel through BPF and back and
//! must stay dense: the monitor uses the range to distinguish a real tag from
//! a stale exit status in the event message.

use tracebox_sys::seccomp::{
    AUDIT_ARCH_AARCH64, AUDIT_ARCH_ARM, AUDIT_ARCH_I386, AUDIT_ARCH_PPC64LE, AUDIT_ARCH_X86_64,
    TraceFilterSpec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CpuArch {
    Unknown = 0,
    X8664 = 1,
    X86 = 2,
    Arm64 = 3,
    Arm = 4,
    Ppc64Le = 5,
}

impl CpuArch {
    pub const MAX_TAG: u16 = CpuArch::Ppc64Le as u16;

    /// The architecture this binary was compiled for.
    pub const fn host() -> CpuArch {
        if cfg!(target_arch = "x86_64") {
            CpuArch::X8664
        } else if cfg!(target_arch = "aarch64") {
            CpuArch::Arm64
        } else if cfg!(target_arch = "arm") {
            CpuArch::Arm
        } else if cfg!(target_arch = "powerpc64") {
            CpuArch::Ppc64Le
        } else {
            CpuArch::Unknown
        }
    }

    /// Maps a `SECCOMP_RET_DATA` tag back to an architecture. `None` when the
    /// value is outside the tag range (e.g. an exit status that raced the
    /// seccomp event).
    pub fn from_tag(tag: u64) -> Option<CpuArch> {
        match tag {
            0 => Some(CpuArch::Unknown),
            1 => Some(CpuArch::X8664),
            2 => Some(CpuArch::X86),
            3 => Some(CpuArch::Arm64),
            4 => Some(CpuArch::Arm),
            5 => Some(CpuArch::Ppc64Le),
            _ => None,
        }
    }

    pub const fn tag(self) -> u16 {
        self as u16
    }

    /// The AUDIT_ARCH_* value seccomp reports for this architecture.
    pub const fn audit_arch(self) -> u32 {
        match self {
            CpuArch::X8664 => AUDIT_ARCH_X86_64,
            CpuArch::X86 => AUDIT_ARCH_I386,
            CpuArch::Arm64 => AUDIT_ARCH_AARCH64,
            CpuArch::Arm => AUDIT_ARCH_ARM,
            CpuArch::Ppc64Le => AUDIT_ARCH_PPC64LE,
            CpuArch::Unknown => 0,
        }
    }

    /// Compat ABIs a filter on this host must tag separately.
    pub const fn host_compat_pairs() -> &'static [(u32, u16)] {
        if cfg!(target_arch = "x86_64") {
            &[(AUDIT_ARCH_I386, CpuArch::X86 as u16)]
        } else if cfg!(target_arch = "aarch64") {
            &[(AUDIT_ARCH_ARM, CpuArch::Arm as u16)]
        } else {
            &[]
        }
    }

    /// Filter spec for this host with the given allowlist.
    pub fn host_filter_spec(allowed: &[i64]) -> TraceFilterSpec<'_> {
        TraceFilterSpec {
            host_audit_arch: CpuArch::host().audit_arch(),
            host_tag: CpuArch::host().tag(),
            unknown_tag: CpuArch::Unknown.tag(),
            compat: CpuArch::host_compat_pairs(),
            allowed,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            CpuArch::X8664 => "[X86-64]",
            CpuArch::X86 => "[X86-32]",
            CpuArch::Arm64 => "[Arm-64]",
            CpuArch::Arm => "[Arm-32]",
            CpuArch::Ppc64Le => "[PPC-64]",
            CpuArch::Unknown => "[UNKNOWN_ARCH]",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for arch in [
            CpuArch::Unknown,
            CpuArch::X8664,
            CpuArch::X86,
            CpuArch::Arm64,
            CpuArch::Arm,
            CpuArch::Ppc64Le,
        ] {
            assert_eq!(CpuArch::from_tag(u64::from(arch.tag())), Some(arch));
        }
    }

    #[test]
    fn out_of_range_tags_rejected() {
        assert_eq!(CpuArch::from_tag(u64::from(CpuArch::MAX_TAG) + 1), None);
        // A typical raced exit status: (code << 8), well outside the range.
        assert_eq!(CpuArch::from_tag(0x100), None);
    }

    #[test]
    fn host_is_not_unknown() {
        assert_ne!(CpuArch::host(), CpuArch::Unknown);
        assert_ne!(CpuArch::host().audit_arch(), 0);
    }
}
