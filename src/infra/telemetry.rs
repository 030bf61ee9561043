use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the page cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pagefront_cache_hit_total",
            Unit::Count,
            "Total number of requests served from a stored page."
        );
        describe_counter!(
            "pagefront_cache_miss_total",
            Unit::Count,
            "Total number of requests that generated a page at the origin."
        );
        describe_counter!(
            "pagefront_cache_bypass_total",
            Unit::Count,
            "Total number of requests a policy kept away from the cache."
        );
        describe_counter!(
            "pagefront_cache_override_total",
            Unit::Count,
            "Total number of requests answered by a policy override."
        );
        describe_counter!(
            "pagefront_cache_store_error_total",
            Unit::Count,
            "Total number of failed or timed-out store calls."
        );
        describe_counter!(
            "pagefront_cache_instruction_error_total",
            Unit::Count,
            "Total number of serve-time instructions skipped after failing."
        );
        describe_histogram!(
            "pagefront_origin_ms",
            Unit::Milliseconds,
            "Origin generation latency in milliseconds."
        );
    });
}
