use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_COMPUTE_MS, METRIC_CORRUPT_ENTRY, METRIC_EVICT, METRIC_L1_ENTRIES, METRIC_L1_HIT,
    METRIC_L2_HIT, METRIC_L3_HIT, METRIC_MISS, METRIC_STORE_FAILURE,
};
use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
#[error("telemetry error: {0}")]
pub struct TelemetryError(String);

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
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
        .map_err(|err| TelemetryError(format!("failed to install tracing subscriber: {err}")))
}

/// Register descriptions for every cache metric with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_L1_HIT,
            Unit::Count,
            "Total number of lookups served by L1."
        );
        describe_counter!(
            METRIC_L2_HIT,
            Unit::Count,
            "Total number of lookups served by the durable L2 tier."
        );
        describe_counter!(
            METRIC_L3_HIT,
            Unit::Count,
            "Total number of lookups served by the remote L3 tier."
        );
        describe_counter!(
            METRIC_MISS,
            Unit::Count,
            "Total number of lookups that missed every tier."
        );
        describe_counter!(
            METRIC_EVICT,
            Unit::Count,
            "Total number of entries removed from a tier by capacity, expiry or invalidation."
        );
        describe_counter!(
            METRIC_STORE_FAILURE,
            Unit::Count,
            "Total number of failed L2/L3 store operations."
        );
        describe_counter!(
            METRIC_CORRUPT_ENTRY,
            Unit::Count,
            "Total number of undecodable L2/L3 records that were discarded."
        );
        describe_histogram!(
            METRIC_COMPUTE_MS,
            Unit::Milliseconds,
            "Producer computation latency in milliseconds."
        );
        describe_gauge!(
            METRIC_L1_ENTRIES,
            Unit::Count,
            "Current number of entries held by L1."
        );
    });
}
