//! Tracing subscriber setup
//!
//! The library only emits `tracing` events; binaries and tests that want to
//! see them call [`init`] once. Verbosity follows `RUST_LOG`, e.g.
//! `RUST_LOG=deferred_query=debug` to watch context acquisition and release.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber: env-filtered, formatted with file and line
///
/// Panics if a global subscriber is already set; use [`try_init`] when that
/// can happen.
pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_line_number(true).with_file(true))
        .init();
}

/// Like [`init`], but returns `false` instead of panicking when a subscriber exists
pub fn try_init() -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_line_number(true).with_file(true).with_test_writer())
        .try_init()
        .is_ok()
}
