//! Storage bootstrap: the SeaORM pool that backs the job table, the dataset
//! registry and every materialized table, plus the bundled migrations.
//!
//! Only the Postgres and SQLite backends are compiled in. An in-memory SQLite
//! database exists per connection, so such URLs always get a single-connection
//! pool; otherwise jobs and the tables they write would land in different
//! databases.

use anyhow::{Context, Result};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::AppConfig;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors raised while bringing up storage.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database after {attempts} attempts: {source}")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: sea_orm::DbErr,
    },
    #[error("Invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Which compiled-in backend a URL targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Postgres,
    Sqlite { in_memory: bool },
}

fn backend_for(url: &str) -> Result<Backend, DatabaseError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "Database URL cannot be empty".to_string(),
        });
    }

    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(Backend::Postgres)
    } else if url.starts_with("sqlite:") {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        Ok(Backend::Sqlite { in_memory })
    } else {
        let scheme = url.split(':').next().unwrap_or_default();
        Err(DatabaseError::InvalidConfiguration {
            message: format!("unsupported database scheme '{scheme}' (expected postgres or sqlite)"),
        })
    }
}

/// Pool options for `cfg`, with the pool size pinned for in-memory SQLite.
fn connect_options(cfg: &AppConfig) -> Result<ConnectOptions, DatabaseError> {
    let backend = backend_for(&cfg.database_url)?;
    let max_connections = match backend {
        Backend::Sqlite { in_memory: true } => 1,
        _ => cfg.db_max_connections.max(1),
    };

    let mut opt = ConnectOptions::new(cfg.database_url.trim());
    opt.max_connections(max_connections)
        .min_connections(max_connections.min(2))
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);
    Ok(opt)
}

/// Connects the pool described by `cfg`, retrying failed connects with
/// doubling delays.
///
/// ```no_run
/// use ingestor::{config::AppConfig, db::init_pool};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let db = init_pool(&AppConfig::default()).await?;
///     Ok(())
/// }
/// ```
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    let opt = connect_options(cfg)?;
    let mut delay = CONNECT_RETRY_DELAY;
    let mut attempt = 1;

    loop {
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                info!(
                    attempt,
                    max_connections = ?opt.get_max_connections(),
                    "Connected to database"
                );
                return Ok(conn);
            }
            Err(source) if attempt >= CONNECT_ATTEMPTS => {
                error!(attempts = attempt, error = %source, "Giving up connecting to database");
                return Err(DatabaseError::ConnectionFailed {
                    attempts: attempt,
                    source,
                }
                .into());
            }
            Err(err) => {
                warn!(
                    attempt,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Database connection failed; retrying"
                );
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

/// Create or upgrade the jobs and dataset registry tables.
pub async fn run_migrations(db: &DatabaseConnection) -> Result<()> {
    Migrator::up(db, None)
        .await
        .context("Failed to apply database migrations")?;
    info!("Database migrations applied");
    Ok(())
}

/// Round-trips `SELECT 1` over the pool.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());
    db.query_one(stmt)
        .await
        .context("Database health check failed")?;
    Ok(())
}
