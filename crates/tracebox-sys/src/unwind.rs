//! FFI bindings for libunwind-ptrace remote unwinding.
//!
//! Only compiled with the `libunwind` feature; links `libunwind-ptrace` and
//! the generic `libunwind` from the system. The driver in the sandbox crate
//! falls back to frame-pointer walking when this feature is off or when
//! `unw_step` gives up mid-stack.

#![allow(non_camel_case_types)]

use std::ffi::c_void;

pub type unw_word_t = libc::c_ulong;
pub type unw_regnum_t = libc::c_int;

/// Opaque address space handle.
pub type unw_addr_space_t = *mut c_void;

/// `unw_cursor_t` is an opaque buffer of 127 words on every 64-bit target.
#[repr(C)]
pub struct unw_cursor_t {
    opaque: [unw_word_t; 127],
}

impl unw_cursor_t {
    pub const fn zeroed() -> Self {
        Self { opaque: [0; 127] }
    }
}

/// The instruction pointer pseudo-register (UNW_REG_IP == -1 in every port).
pub const UNW_REG_IP: unw_regnum_t = -1;

/// Frame-pointer register number for the host.
#[cfg(target_arch = "x86_64")]
pub const UNW_FP_REG: unw_regnum_t = 6; // UNW_X86_64_RBP
#[cfg(target_arch = "aarch64")]
pub const UNW_FP_REG: unw_regnum_t = 29; // UNW_AARCH64_X29
#[cfg(target_arch = "arm")]
pub const UNW_FP_REG: unw_regnum_t = 11; // UNW_ARM_R11
#[cfg(target_arch = "powerpc64")]
pub const UNW_FP_REG: unw_regnum_t = 1; // UNW_PPC64_R1

#[link(name = "unwind-ptrace")]
#[link(name = "unwind-generic")]
#[link(name = "unwind")]
extern "C" {
    pub static _UPT_accessors: c_void;

    pub fn _UPT_create(pid: libc::pid_t) -> *mut c_void;
    pub fn _UPT_destroy(context: *mut c_void);

    #[cfg_attr(target_arch = "x86_64", link_name = "_Ux86_64_create_addr_space")]
    #[cfg_attr(target_arch = "aarch64", link_name = "_Uaarch64_create_addr_space")]
    pub fn unw_create_addr_space(
        accessors: *const c_void,
        byte_order: libc::c_int,
    ) -> unw_addr_space_t;

    #[cfg_attr(target_arch = "x86_64", link_name = "_Ux86_64_init_remote")]
    #[cfg_attr(target_arch = "aarch64", link_name = "_Uaarch64_init_remote")]
    pub fn unw_init_remote(
        cursor: *mut unw_cursor_t,
        addr_space: unw_addr_space_t,
        context: *mut c_void,
    ) -> libc::c_int;

    #[cfg_attr(target_arch = "x86_64", link_name = "_Ux86_64_get_reg")]
    #[cfg_attr(target_arch = "aarch64", link_name = "_Uaarch64_get_reg")]
    pub fn unw_get_reg(
        cursor: *mut unw_cursor_t,
        reg: unw_regnum_t,
        value: *mut unw_word_t,
    ) -> libc::c_int;

    #[cfg_attr(target_arch = "x86_64", link_name = "_Ux86_64_step")]
    #[cfg_attr(target_arch = "aarch64", link_name = "_Uaarch64_step")]
    pub fn unw_step(cursor: *mut unw_cursor_t) -> libc::c_int;
}
