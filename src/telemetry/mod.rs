//! Observability: tracing, metrics and OpenTelemetry export.

pub mod metrics;
pub mod tracing;

pub use self::metrics::{
    record_api_key_validation, record_auth_attempt, record_maintenance_run,
    record_permission_check, AuthOutcome, MetricsState,
};
pub use self::tracing::{init_telemetry, shutdown_telemetry};
