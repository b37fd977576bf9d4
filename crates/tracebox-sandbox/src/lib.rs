//! tracebox-sandbox: ptrace supervision of seccomp-sandboxed processes
//!
//! This crate runs an untrusted binary under a seccomp filter whose default
//! verdict is `SECCOMP_RET_TRACE` and supervises the resulting process tree
//! from a dedicated monitor thread. Every filtered syscall, lifecycle event
//! (fork/clone/exec/exit), signal, deadline and kill request is folded into
//! one terminal [`SandboxResult`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use tracebox_sandbox::{Executor, Policy, Sandbox};
//!
//! let executor = Executor::new("/usr/bin/some-tool", &["--flag"]);
//! let policy = Policy::builder().allow_default_runtime().build();
//! let mut sandbox = Sandbox::new(executor, policy);
//! let result = sandbox.run();
//! println!("{result}");
//! ```
//!
//! ## Pieces
//!
//! - **executor** - forks the sandboxee and applies resource limits
//! - **policy** - the compiled seccomp program plus stack-trace gating
//! - **notify** - user callbacks for syscall trace decisions and signals
//! - **monitor** - the single-threaded ptrace event loop
//! - **unwind** - remote stack capture and symbolization for post-mortems
//!
//! ## Requirements
//!
//! - Linux kernel 3.8+ (seccomp `RET_TRACE`, `PTRACE_O_EXITKILL`)
//! - Yama `ptrace_scope` <= 1

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod arch;
pub mod client;
pub mod comms;
pub mod config;
pub mod executor;
pub mod monitor;
pub mod notify;
pub mod policy;
pub mod regs;
pub mod result;
pub mod stack_trace;
pub mod sandbox;
pub mod syscall;
pub mod unwind;
pub mod util;

pub use arch::CpuArch;
pub use comms::Comms;
pub use config::MonitorOptions;
pub use executor::{Executor, Limits, SandboxeeProcess};
pub use monitor::Monitor;
pub use monitor::ptrace::PtraceMonitor;
pub use notify::{Notify, TraceAction, ViolationType};
pub use policy::{Policy, PolicyBuilder};
pub use regs::Regs;
pub use result::{FinalStatus, MonitorFailure, SandboxResult, SetupFailure, Violation};
pub use sandbox::Sandbox;
pub use syscall::Syscall;
