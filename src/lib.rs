//! Portcullis - credential, session and workspace access control over gRPC.

pub mod auth;
pub mod config;
pub mod error;
pub mod grpc;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod oauth;
pub mod repository;
pub mod schema;
pub mod tasks;
pub mod telemetry;
pub mod usecase;

use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use auth::{LoginAttemptGuard, PasswordHasher, PasswordPolicy, TokenIssuer};
use error::StartupError;
use grpc::{AuthServiceImpl, WorkspaceServiceImpl};
use handlers::health::HealthState;
use middleware::{CredentialRateLimiter, RateLimitConfig};
use oauth::OAuthRegistry;
use repository::memory::{
    MemoryApiKeyRepository, MemoryLoginAttemptStore, MemoryOAuthStateStore, MemoryProbe,
    MemoryRoleRepository, MemorySessionStore, MemoryUserRepository, MemoryWorkspaceRepository,
};
use repository::postgres::{
    Database, PgApiKeyRepository, PgRoleRepository, PgUserRepository, PgWorkspaceRepository,
};
use repository::redis::{
    create_redis_pool, RedisLoginAttemptStore, RedisOAuthStateStore, RedisProbe,
    RedisSessionStore,
};
use repository::{
    ApiKeyRepository, HealthProbe, LoginAttemptStore, OAuthStateStore, RoleRepository,
    SessionStore, UserRepository, WorkspaceRepository,
};
use tasks::MaintenanceTask;
use telemetry::MetricsState;
use usecase::{AuthUseCase, RbacUseCase};

pub use config::Config;
pub use telemetry::{init_telemetry, shutdown_telemetry};

const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Every persistence port the services need.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserRepository>,
    pub workspaces: Arc<dyn WorkspaceRepository>,
    pub roles: Arc<dyn RoleRepository>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub sessions: Arc<dyn SessionStore>,
    pub login_attempts: Arc<dyn LoginAttemptStore>,
    pub oauth_states: Arc<dyn OAuthStateStore>,
    pub probes: Vec<Arc<dyn HealthProbe>>,
}

impl Stores {
    /// PostgreSQL for durable records, Redis for sessions and counters.
    pub fn connect(config: &Config) -> Result<Self, StartupError> {
        let db = Database::connect(&config.database)?;
        let redis = create_redis_pool(&config.redis)?;

        Ok(Self {
            users: Arc::new(PgUserRepository::new(db.clone())),
            workspaces: Arc::new(PgWorkspaceRepository::new(db.clone())),
            roles: Arc::new(PgRoleRepository::new(db.clone())),
            api_keys: Arc::new(PgApiKeyRepository::new(db.clone())),
            sessions: Arc::new(RedisSessionStore::new(redis.clone())),
            login_attempts: Arc::new(RedisLoginAttemptStore::new(redis.clone())),
            oauth_states: Arc::new(RedisOAuthStateStore::new(redis.clone())),
            probes: vec![
                Arc::new(db) as Arc<dyn HealthProbe>,
                Arc::new(RedisProbe::new(redis)),
            ],
        })
    }

    pub fn in_memory() -> Self {
        let users = Arc::new(MemoryUserRepository::new());
        Self {
            roles: Arc::new(MemoryRoleRepository::with_users(users.clone())),
            users,
            workspaces: Arc::new(MemoryWorkspaceRepository::new()),
            api_keys: Arc::new(MemoryApiKeyRepository::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            login_attempts: Arc::new(MemoryLoginAttemptStore::new()),
            oauth_states: Arc::new(MemoryOAuthStateStore::new()),
            probes: vec![
                Arc::new(MemoryProbe::new("database")) as Arc<dyn HealthProbe>,
                Arc::new(MemoryProbe::new("redis")),
            ],
        }
    }
}

/// Fully wired application: use cases plus the shared guards around them.
#[derive(Clone)]
pub struct App {
    pub auth: Arc<AuthUseCase>,
    pub rbac: Arc<RbacUseCase>,
    pub limiter: CredentialRateLimiter,
    pub metrics: MetricsState,
    stores: Stores,
    oauth_state_ttl_secs: u64,
    maintenance_interval: Duration,
}

impl App {
    pub fn build(config: &Config, stores: Stores) -> Result<Self, StartupError> {
        Self::build_with_oauth(config, stores, OAuthRegistry::from_config(&config.oauth)?)
    }

    /// Same as [`build`](Self::build) with an explicit provider registry.
    pub fn build_with_oauth(
        config: &Config,
        stores: Stores,
        oauth: OAuthRegistry,
    ) -> Result<Self, StartupError> {
        let tokens = TokenIssuer::from_config(&config.jwt)?;
        let attempts =
            LoginAttemptGuard::from_config(Arc::clone(&stores.login_attempts), &config.security);

        let auth = AuthUseCase::new(
            Arc::clone(&stores.users),
            Arc::clone(&stores.sessions),
            attempts,
            tokens,
            PasswordHasher::new(config.security.password_hash_cost),
            PasswordPolicy::from_config(&config.security),
            oauth,
        );
        let rbac = RbacUseCase::new(
            Arc::clone(&stores.workspaces),
            Arc::clone(&stores.roles),
            Arc::clone(&stores.api_keys),
        );

        info!(
            oauth_providers = ?auth.oauth().names(),
            rate_limiting = config.security.rate_limiting_enabled,
            "Application wired"
        );

        Ok(Self {
            auth: Arc::new(auth),
            rbac: Arc::new(rbac),
            limiter: CredentialRateLimiter::new(&RateLimitConfig::from_config(&config.security)),
            metrics: MetricsState::new(config.telemetry.metrics_enabled),
            stores,
            oauth_state_ttl_secs: config.oauth.state_ttl_secs,
            maintenance_interval: Duration::from_secs(config.maintenance.interval_secs),
        })
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn auth_service(&self) -> AuthServiceImpl {
        AuthServiceImpl::new(
            Arc::clone(&self.auth),
            Arc::clone(&self.stores.oauth_states),
            self.limiter.clone(),
            self.oauth_state_ttl_secs,
            self.stores.probes.clone(),
        )
    }

    pub fn workspace_service(&self) -> WorkspaceServiceImpl {
        WorkspaceServiceImpl::new(Arc::clone(&self.auth), Arc::clone(&self.rbac))
    }

    pub fn maintenance_task(&self) -> MaintenanceTask {
        MaintenanceTask::new(
            Arc::clone(&self.stores.sessions),
            self.limiter.clone(),
            self.maintenance_interval,
        )
    }

    pub fn router(&self) -> Router {
        create_router(
            HealthState::new(self.stores.probes.clone()),
            self.metrics.clone(),
        )
    }
}

/// Health and metrics endpoints. The RPC surface is served by tonic.
pub fn create_router(health: HealthState, metrics: MetricsState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    #[allow(deprecated)]
    let timeout = TimeoutLayer::new(HTTP_REQUEST_TIMEOUT);

    let health_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/live", get(handlers::health::live_check))
        .route("/health/ready", get(handlers::health::ready_check))
        .with_state(health);

    let metrics_routes = Router::new()
        .route("/metrics", get(telemetry::metrics::metrics_handler))
        .with_state(metrics);

    Router::new()
        .merge(health_routes)
        .merge(metrics_routes)
        .fallback(fallback_handler)
        .layer(trace_layer)
        .layer(timeout)
}

async fn fallback_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "Not found", "code": "NOT_FOUND"})),
    )
}
