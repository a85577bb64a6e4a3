//! PostgreSQL adapters over a diesel r2d2 pool.

mod api_keys;
mod users;
mod workspaces;

pub use api_keys::PgApiKeyRepository;
pub use users::PgUserRepository;
pub use workspaces::{PgRoleRepository, PgWorkspaceRepository};

use std::time::Duration;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};
use diesel::PgConnection;
use tracing::info;

use super::HealthProbe;
use crate::config::DatabaseConfig;
use crate::error::{StoreError, StoreResult};

pub type DbPool = r2d2::Pool<ConnectionManager<PgConnection>>;

/// Applies a server-side `statement_timeout` to every pooled connection.
#[derive(Debug, Clone, Copy)]
struct StatementTimeout {
    millis: u64,
}

impl CustomizeConnection<PgConnection, r2d2::Error> for StatementTimeout {
    fn on_acquire(&self, conn: &mut PgConnection) -> Result<(), r2d2::Error> {
        diesel::sql_query(format!("SET statement_timeout = {}", self.millis))
            .execute(conn)
            .map(|_| ())
            .map_err(r2d2::Error::QueryError)
    }
}

pub fn create_db_pool(config: &DatabaseConfig) -> StoreResult<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(&config.url);
    let pool = r2d2::Pool::builder()
        .max_size(config.max_connections)
        .min_idle(Some(config.min_idle))
        .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
        .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
        .max_lifetime(Some(Duration::from_secs(config.max_lifetime_secs)))
        .connection_customizer(Box::new(StatementTimeout {
            millis: config.statement_timeout_secs * 1000,
        }))
        .build(manager)
        .map_err(|e| StoreError::Unavailable(format!("database pool: {}", e)))?;

    info!(
        max_connections = config.max_connections,
        min_idle = config.min_idle,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Pool handle that runs blocking diesel calls off the async executor,
/// bounded by a per-call timeout.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    call_timeout: Duration,
}

impl Database {
    pub fn new(pool: DbPool, call_timeout: Duration) -> Self {
        Self { pool, call_timeout }
    }

    pub fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        Ok(Self::new(
            create_db_pool(config)?,
            Duration::from_secs(config.statement_timeout_secs),
        ))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Pool exhaustion and timeouts come back as `StoreError::Unavailable`.
    /// A timed-out call keeps its connection until the server-side statement
    /// timeout cancels it.
    pub async fn run<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut PgConnection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Unavailable(format!("database pool: {}", e)))?;
            f(&mut conn)
        });

        match tokio::time::timeout(self.call_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(StoreError::Backend(format!("database task failed: {}", e))),
            Err(_) => Err(StoreError::Unavailable(format!(
                "database call exceeded {}ms",
                self.call_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl HealthProbe for Database {
    fn component(&self) -> &'static str {
        "database"
    }

    async fn ping(&self) -> StoreResult<()> {
        self.run(|conn| {
            diesel::sql_query("SELECT 1")
                .execute(conn)
                .map(|_| ())
                .map_err(StoreError::from)
        })
        .await
    }
}
