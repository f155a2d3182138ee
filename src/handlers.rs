use axum::{extract::State, http::Uri, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::cache::RegionSpec;
use crate::gate::Gate;
use crate::metrics::MetricsSnapshot;
use crate::response::ErrorResponse;
use crate::tier::TierTable;

static START_TIME: LazyLock<Instant> = LazyLock::new(Instant::now);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct AdmissionStats {
    pub metrics: MetricsSnapshot,
    pub live_buckets: usize,
    pub max_buckets: usize,
    pub tiers: TierTable,
    pub regions: Vec<RegionSpec>,
}

/// Liveness check
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: START_TIME.elapsed().as_secs(),
    })
}

/// Counters, bucket usage and the effective limits
pub async fn admission_stats(State(gate): State<Arc<Gate>>) -> impl IntoResponse {
    Json(AdmissionStats {
        metrics: gate.metrics().snapshot(),
        live_buckets: gate.registry().len(),
        max_buckets: gate.registry().max_entries(),
        tiers: *gate.tiers(),
        regions: gate.cache().regions().to_vec(),
    })
}

pub async fn not_found(uri: Uri) -> ErrorResponse {
    ErrorResponse::new("not_found", &format!("No route for {}", uri.path()), 404)
}

/// Pin the uptime origin to process start rather than the first health request.
pub fn mark_start() {
    LazyLock::force(&START_TIME);
}
