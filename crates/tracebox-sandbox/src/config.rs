//! Monitor-wide options.
//!
//! One options struct per sandbox, set at construction. Tests override the
//! fields they care about instead of mutating process-global state.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Log stack traces of every monitored task that terminates with a
    /// signal, not only the main one.
    pub log_all_stack_traces: bool,

    /// How long shutdown may spend reaping stragglers when
    /// `log_all_stack_traces` is on.
    pub stack_traces_collection_timeout: Duration,

    /// Escape hatch: every traced syscall is allowed. For bring-up only.
    pub permit_all: bool,

    /// Escape hatch: every traced syscall is allowed and appended to this
    /// file, one description per line.
    pub permit_all_and_log: Option<PathBuf>,

    /// Disable stack trace collection entirely.
    pub disable_stack_traces: bool,

    /// Run the unwinder in a forked helper process (the default). Turning
    /// this off unwinds in-process, which is required for the libunwind
    /// driver (only the tracer thread may use it) and faster, but exposes
    /// the monitor to whatever the sandboxee left behind in its memory.
    pub sandboxed_unwinder: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            log_all_stack_traces: false,
            stack_traces_collection_timeout: Duration::from_secs(1),
            permit_all: false,
            permit_all_and_log: None,
            disable_stack_traces: false,
            sandboxed_unwinder: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_strict() {
        let options = MonitorOptions::default();
        assert!(!options.permit_all);
        assert!(options.permit_all_and_log.is_none());
        assert_eq!(options.stack_traces_collection_timeout, Duration::from_secs(1));
    }
}
