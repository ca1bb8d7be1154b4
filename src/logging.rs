//! Logging and tracing setup for the validator.
//!
//! Diagnostics produced during a run go through the injectable reporter; the
//! default reporter turns them into `tracing` events, so installing a
//! subscriber here is all a host needs to see them. `RUST_LOG` overrides the
//! default `info` filter, e.g. `RUST_LOG=sfi_validator::trace=info` for the
//! instruction trace.

use std::sync::Once;
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

static INIT: Once = Once::new();

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber in `format`.
///
/// Only the first call in a process does anything. A subscriber already
/// installed by the host is left in place.
pub fn init_with(format: LogFormat) {
    INIT.call_once(|| {
        let registry = tracing_subscriber::registry().with(default_filter());
        let installed = match format {
            LogFormat::Text => registry
                .with(
                    fmt::layer()
                        .with_span_events(FmtSpan::CLOSE)
                        .with_target(true),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(
                    fmt::layer()
                        .json()
                        .with_span_events(FmtSpan::CLOSE)
                        .with_target(true)
                        .with_current_span(true),
                )
                .try_init(),
        };
        if installed.is_ok() {
            info!(?format, "validator tracing initialized");
        }
    });
}

/// Human readable output.
pub fn init_tracing() {
    init_with(LogFormat::Text);
}

/// One JSON object per event.
pub fn init_tracing_json() {
    init_with(LogFormat::Json);
}

/// Span around one validator run.
#[macro_export]
macro_rules! span_trace {
    ($name:expr) => {
        tracing::info_span!($name)
    };
    ($name:expr, $($field:tt)*) => {
        tracing::info_span!($name, $($field)*)
    };
}
