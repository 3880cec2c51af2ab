//! Logging initialization for Etude.
//!
//! The engine logs through `tracing`; nothing is printed until a
//! subscriber is installed. Call one of these functions once, at the start
//! of `main`.
//!
//! The level is controlled by the `RUST_LOG` environment variable:
//!
//! ```bash
//! # Parse rejections, evictions and other per-connection detail
//! RUST_LOG=debug etude
//!
//! # Fine-grained control
//! RUST_LOG=etude_core=debug,etude_pool=warn etude
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize human-readable logging at `info` unless `RUST_LOG` says
/// otherwise.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize human-readable logging with a default level used when
/// `RUST_LOG` is not set.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Initialize JSON-formatted logging (one object per line) for log
/// aggregation.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_json(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Like [`init_logging_with_level`] but returns `false` instead of
/// panicking when a subscriber already exists. Handy in tests.
pub fn try_init_logging(level: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .is_ok()
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
