//! Tracing subscriber setup for the `monorail` binary.
//!
//! The library crate never installs a global subscriber (`SPEC_FULL.md`
//! §2); this module is the one place that does, filtered by the
//! `MONORAIL_LOG` environment variable the way the teacher's `hurry` binary
//! filters on `HURRY_LOG`. A `tracing_error::ErrorLayer` is layered in so
//! `color_eyre` reports can render the active span trace.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber. Call once, before anything else logs.
pub fn init() {
    let filter = EnvFilter::try_from_env("MONORAIL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(ErrorLayer::default())
        .with(filter)
        .init();
}
