use std::env;
use tracing_subscriber::{fmt::time::ChronoLocal, EnvFilter};

use super::error::{WafError, WafResult};

/// Initialize the logging system.
///
/// The filter comes from `RUST_LOG` and falls back to `info`.
pub fn init_logging() -> WafResult<()> {
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_timer(ChronoLocal::rfc_3339())
        .try_init()
        .map_err(|e| WafError::Internal(format!("failed to set tracing subscriber: {e}")))
}

/// Create a new span for tracking request context
pub fn create_request_span(request_id: &str, source: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        request_id = %request_id,
        source = %source,
    )
}

/// Log a rate limit decision
pub fn log_rate_limit(key: &str, exceeded: bool) {
    if exceeded {
        tracing::warn!(key = %key, event = "rate_limit_exceeded");
    } else {
        tracing::debug!(key = %key, event = "rate_limit_check");
    }
}

/// Log a blocked request
pub fn log_block(source: &str, category: &str, reason: &str) {
    metrics::increment_counter!("shield_verdicts_total", "verdict" => "block", "category" => category.to_string());
    tracing::warn!(
        source = %source,
        category = %category,
        reason = %reason,
        event = "request_blocked"
    );
}

/// Log an allowed request
pub fn log_allow(source: &str) {
    metrics::increment_counter!("shield_verdicts_total", "verdict" => "allow", "category" => "none");
    tracing::debug!(source = %source, event = "request_allowed");
}

/// Log a dependency failure that was folded into a permissive answer
pub fn log_fail_open(component: &'static str, subject: &str, details: &str) {
    metrics::increment_counter!("shield_fail_open_total", "component" => component);
    tracing::warn!(
        component = component,
        subject = %subject,
        details = %details,
        event = "fail_open"
    );
}
