//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global `tracing` subscriber
//! - Resolve the log filter from `RUST_LOG`, falling back to config
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - `RUST_LOG` always wins over the configured filter

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor config provide one.
pub const DEFAULT_FILTER: &str = "routeway=info,tower_http=info";

/// Build the filter: `RUST_LOG` first, then `configured`, then the default.
pub fn resolve_filter(configured: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = configured
            .filter(|f| !f.trim().is_empty())
            .unwrap_or(DEFAULT_FILTER);
        EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    })
}

/// Install the global subscriber. Safe to call more than once; later calls are ignored.
pub fn init_logging(configured: Option<&str>) {
    let result = tracing_subscriber::registry()
        .with(resolve_filter(configured))
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_falls_back() {
        // Must not panic on garbage directives.
        let _ = resolve_filter(Some("[[[not a filter"));
        let _ = resolve_filter(Some(""));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(Some("routeway=debug"));
        init_logging(None);
    }
}
