//! Liveness and readiness endpoints for orchestrators.
//!
//! `/health/live` never touches a backend. `/health/ready` pings every
//! registered probe with a bounded wait and answers 503 if any is down.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::repository::HealthProbe;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct HealthState {
    probes: Arc<[Arc<dyn HealthProbe>]>,
}

impl HealthState {
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>) -> Self {
        Self {
            probes: probes.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    NotReady,
}

#[derive(Debug, Serialize)]
pub struct ReadinessReport {
    pub status: Readiness,
    pub checks: BTreeMap<&'static str, ComponentStatus>,
}

/// Serialized as `{"status": "up", "latency_ms": 3}` or
/// `{"status": "down", "error": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ComponentStatus {
    Up { latency_ms: u64 },
    Down { error: String },
}

impl ComponentStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, ComponentStatus::Up { .. })
    }
}

pub async fn health_check() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        status: "healthy",
        service: "portcullis",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

pub async fn live_check() -> StatusCode {
    StatusCode::OK
}

pub async fn ready_check(State(state): State<HealthState>) -> (StatusCode, Json<ReadinessReport>) {
    let mut checks = BTreeMap::new();
    for probe in state.probes.iter() {
        checks.insert(probe.component(), probe_component(probe.as_ref()).await);
    }

    let (code, status) = if checks.values().all(ComponentStatus::is_up) {
        (StatusCode::OK, Readiness::Ready)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Readiness::NotReady)
    };

    (code, Json(ReadinessReport { status, checks }))
}

async fn probe_component(probe: &dyn HealthProbe) -> ComponentStatus {
    let started = Instant::now();
    match tokio::time::timeout(PROBE_TIMEOUT, probe.ping()).await {
        Ok(Ok(())) => ComponentStatus::Up {
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        },
        Ok(Err(e)) => ComponentStatus::Down {
            error: e.to_string(),
        },
        Err(_) => ComponentStatus::Down {
            error: format!("no response within {}ms", PROBE_TIMEOUT.as_millis()),
        },
    }
}
