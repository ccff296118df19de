//! Data model for the exam grading backend: the paper catalog, grading against a language model,
//! and submission statistics.

use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub mod catalog;
pub mod grading;
pub mod stats;

static INIT_LOGGING: Once = Once::new();

/// Install a global `tracing` subscriber.
///
/// The filter is read from `RUST_LOG` and defaults to `info`. Calling this more than once is
/// harmless, so tests can call it freely.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init();
    });
}
