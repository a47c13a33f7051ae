//! Logging initialization.
//!
//! Controlled by the `DSTACK_VERIFIER_DEBUG` env var: when set to `1` or
//! `true`, DEBUG level is enabled for this crate; otherwise logging stays at
//! ERROR level (effectively silent). Long-running services call `init()`
//! once at startup; calling it again is a no-op.

use std::sync::OnceLock;

use log::LevelFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Initialize the logging subsystem. Idempotent.
pub fn init() {
    INIT.get_or_init(init_impl);
}

fn init_impl() {
    let level = if is_debug_env_set() {
        LevelFilter::Debug
    } else {
        LevelFilter::Error
    };

    env_logger::Builder::new()
        .filter_module("dstack_verifier", level)
        .format_timestamp_millis()
        .try_init()
        .ok(); // Ignore error if already initialized
}

fn is_debug_env_set() -> bool {
    std::env::var("DSTACK_VERIFIER_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
