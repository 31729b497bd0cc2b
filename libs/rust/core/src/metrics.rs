//! OpenTelemetry instruments for cache reconciliation and prediction.
//!
//! Instruments come from the global meter; they are no-ops until the host
//! process installs a meter provider.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

#[derive(Clone, Debug)]
pub struct CoachMetrics {
    pub cache_hits_total: Counter<u64>,
    pub downloads_total: Counter<u64>,
    pub download_failures_total: Counter<u64>,
    pub downloaded_bytes_total: Counter<u64>,
    pub predict_latency_ms: Histogram<f64>,
}

static COACH_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("coach"));

pub static COACH_METRICS: Lazy<CoachMetrics> = Lazy::new(|| CoachMetrics {
    cache_hits_total: COACH_METER
        .u64_counter("coach_cache_hits_total")
        .with_description("resolve_and_cache calls satisfied by the local manifest")
        .build(),
    downloads_total: COACH_METER
        .u64_counter("coach_downloads_total")
        .with_description("Model artifacts downloaded")
        .build(),
    download_failures_total: COACH_METER
        .u64_counter("coach_download_failures_total")
        .with_description("Artifact downloads that failed")
        .build(),
    downloaded_bytes_total: COACH_METER
        .u64_counter("coach_downloaded_bytes_total")
        .with_description("Artifact bytes written to the cache")
        .with_unit("By")
        .build(),
    predict_latency_ms: COACH_METER
        .f64_histogram("coach_predict_latency_ms")
        .with_description("Normalize + inference + ranking latency (ms)")
        .with_unit("ms")
        .build(),
});
