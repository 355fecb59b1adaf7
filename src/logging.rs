//! Tracing subscriber setup for the `d2b` binary.
//!
//! Logs go to stderr so stdout stays machine readable (query results,
//! GeoJSON, completions). The filter comes from `RUST_LOG`, defaulting to
//! `info`.

use tracing_subscriber::{filter::LevelFilter, EnvFilter};

pub fn init() {
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    // try_init: tests may install their own subscriber first
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .try_init();
}
