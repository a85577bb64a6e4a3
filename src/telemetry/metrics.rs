//! Prometheus counters and histograms for authentication and authorization.

use std::sync::OnceLock;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;

static RECORDER: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Shared handle to the process-wide Prometheus recorder, if one is active.
#[derive(Clone, Default)]
pub struct MetricsState {
    handle: Option<PrometheusHandle>,
}

impl MetricsState {
    /// The recorder is global, so only the first enabled call installs it.
    /// An install failure is logged and leaves this state disabled.
    pub fn new(enabled: bool) -> Self {
        if !enabled {
            return Self::disabled();
        }

        let handle = RECORDER.get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| warn!(error = %e, "prometheus recorder unavailable, metrics off"))
                .ok()
        });
        Self {
            handle: handle.clone(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }

    pub fn is_enabled(&self) -> bool {
        self.handle.is_some()
    }
}

pub async fn metrics_handler(State(state): State<MetricsState>) -> Response {
    match state.render() {
        Some(body) => body.into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics disabled").into_response(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    InvalidCredentials,
    AccountLocked,
    AccountInactive,
    InvalidToken,
    TokenExpired,
    Rejected,
    Error,
}

impl AuthOutcome {
    pub fn as_str(self) -> &'static str {
        use AuthOutcome::*;
        match self {
            Success => "success",
            InvalidCredentials => "invalid_credentials",
            AccountLocked => "account_locked",
            AccountInactive => "account_inactive",
            InvalidToken => "invalid_token",
            TokenExpired => "token_expired",
            Rejected => "rejected",
            Error => "error",
        }
    }
}

/// `action` is one of register, login, refresh, oauth.
pub fn record_auth_attempt(action: &'static str, outcome: AuthOutcome) {
    counter!(
        "auth_attempts_total",
        "action" => action,
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

pub fn record_permission_check(granted: bool, duration: Duration) {
    let granted = if granted { "true" } else { "false" };
    counter!("permission_checks_total", "granted" => granted).increment(1);
    histogram!("permission_check_duration_seconds").record(duration);
}

/// `outcome` is one of valid, not_found, revoked, expired.
pub fn record_api_key_validation(outcome: &'static str) {
    counter!("api_key_validations_total", "outcome" => outcome).increment(1);
}

pub fn record_maintenance_run(task: &'static str, success: bool) {
    let outcome = if success { "success" } else { "error" };
    counter!("maintenance_runs_total", "task" => task, "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_outcome_labels() {
        assert_eq!(AuthOutcome::Success.as_str(), "success");
        assert_eq!(
            AuthOutcome::InvalidCredentials.as_str(),
            "invalid_credentials"
        );
        assert_eq!(AuthOutcome::TokenExpired.as_str(), "token_expired");
    }

    #[test]
    fn test_metrics_state_disabled() {
        let state = MetricsState::new(false);
        assert!(!state.is_enabled());
        assert!(state.render().is_none());
    }

    #[test]
    fn test_recording_without_recorder_is_a_no_op() {
        record_auth_attempt("login", AuthOutcome::Success);
        record_permission_check(true, Duration::from_millis(1));
        record_api_key_validation("valid");
        record_maintenance_run("session_sweep", true);
    }
}
