//! Logging (spec.md §7)
//!
//! `host::Instance` logs structured events -- command dispatch failures,
//! orphan bubbles, token timeouts -- through the `log` crate facade, the
//! way the rest of this corpus wires up logging: callers install whatever
//! subscriber they like (`env_logger`, `tracing-subscriber`, ...), we only
//! ever call `log::{warn,error,debug}!`.

use crate::errors::ErrorCategory;

/// Initialize a basic `env_logger` subscriber, honoring `RUST_LOG`. Call
/// once from a binary's `main`; library embedders are expected to install
/// their own subscriber instead.
pub fn init_stderr_logger() {
    let _ = env_logger::try_init();
}

/// Log a runtime error with its category, the shape `host::Instance`
/// reports failed command dispatch/parse errors in.
pub fn log_error(category: ErrorCategory, message: &str) {
    log::error!("[{category}] {message}");
}

pub fn log_warn(category: ErrorCategory, message: &str) {
    log::warn!("[{category}] {message}");
}
