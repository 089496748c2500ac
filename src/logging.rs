//! Logging setup for acceptance-test runs.
//!
//! The gates emit `tracing` events on every transition: admission, wait,
//! release, cooldown start and end, enter and exit. These helpers install a
//! subscriber that writes them to **stderr**, filtered by `RUST_LOG`.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Controls log levels (e.g., `info`, `provider_acctest_gate=debug`)
//!
//! # Examples
//!
//! ```bash
//! # Admissions and cooldowns only
//! RUST_LOG=provider_acctest_gate=info cargo test
//!
//! # Every wait, release, enter and exit
//! RUST_LOG=provider_acctest_gate=debug cargo test -- --nocapture
//! ```

use tracing_subscriber::fmt::format::{DefaultFields, Format};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

fn layer<S, W>(writer: W) -> fmt::Layer<S, DefaultFields, Format, W>
where
    W: for<'writer> MakeWriter<'writer> + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
}

/// Install the global subscriber, writing to stderr.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default(DEFAULT_FILTER);
}

/// Like [`init_logging`], with `default_filter` used when `RUST_LOG` is unset.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_filter: &str) {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(layer(std::io::stderr))
        .init();
}

/// Try to install the global subscriber.
///
/// Returns `false` if one was already set.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(env_filter(DEFAULT_FILTER))
        .with(layer(std::io::stderr))
        .try_init()
        .is_ok()
}

/// Install a subscriber whose output is captured by the test harness.
///
/// Safe to call from every test; only the first call has an effect.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(env_filter(DEFAULT_FILTER))
        .with(layer(fmt::TestWriter::new()))
        .try_init();
}
