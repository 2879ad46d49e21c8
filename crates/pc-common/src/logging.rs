//! Structured Logging
//!
//! Two output modes, picked at startup:
//! - JSON lines (`LOG_FORMAT=json`) for log shipping
//! - Human-readable text otherwise
//!
//! Level filtering follows `RUST_LOG` (default `info`), e.g.
//! `RUST_LOG=pc_iam=debug,sqlx=warn`.
//!
//! ```rust,ignore
//! pc_common::logging::init_logging("pc-bootstrap");
//! tracing::info!(principal_id = %id, "Principal created");
//! ```
//!
//! Repository code never logs passwords, derived keys or decrypted
//! credential material; only ids, versions and counts.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const DEFAULT_FILTER: &str = "info";

/// Output format selected from `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("LOG_FORMAT").unwrap_or_default())
    }

    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber for a binary.
///
/// Must be called once, before any other tracing call.
pub fn init_logging(service_name: &str) {
    match LogFormat::from_env() {
        LogFormat::Json => init_json_logging(env_filter()),
        LogFormat::Text => init_text_logging(env_filter()),
    }
    tracing::info!(service = service_name, "Logging initialised");
}

fn init_json_logging(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .init();
}

fn init_text_logging(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(true),
        )
        .init();
}

/// Subscriber for test runs. Output goes through the libtest capture and
/// repeated calls across tests are ignored.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_test_writer().with_target(true))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("text"), LogFormat::Text);
        assert_eq!(LogFormat::parse(""), LogFormat::Text);
    }

    #[test]
    fn test_init_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::debug!("still alive");
    }
}
