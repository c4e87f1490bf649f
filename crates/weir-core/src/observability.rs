//! Observability infrastructure for weir.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors so every component tags its
//! work with the same fields (`pipeline`, `key`, `op`).

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times; subsequent
/// calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: controls log levels (e.g. `info`, `weir_reduce=debug`)
///
/// # Example
///
/// ```rust
/// use weir_core::observability::{LogFormat, init_logging};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for reducer operations with standard fields.
///
/// # Example
///
/// ```rust
/// use weir_core::observability::reduce_span;
///
/// let span = reduce_span("register_member", "ingest", "chain-7f3a");
/// let _guard = span.enter();
/// // ... do reducer operation
/// ```
#[must_use]
pub fn reduce_span(operation: &str, pipeline: &str, key: &str) -> Span {
    tracing::info_span!(
        "reduce",
        op = operation,
        pipeline = pipeline,
        key = key,
    )
}

/// Creates a span for sweeper passes.
#[must_use]
pub fn sweep_span(pipeline: &str) -> Span {
    tracing::info_span!("sweep", pipeline = pipeline)
}
