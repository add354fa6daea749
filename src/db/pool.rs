//! Connection pool construction.
//!
//! This module builds database-specific pools (MySqlPool, PgPool, SqlitePool)
//! from a `ConnectionTarget` plus a scoped `Secret`, and classifies handshake
//! failures into `ConnectionErrorKind`s so callers can pick a retry policy.

use crate::config::PoolOptions;
use crate::db::credentials::Secret;
use crate::error::{ConnectionErrorKind, PortalError, PortalResult};
use crate::models::{ConnectionTarget, Engine, TlsPolicy};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool.
    pub async fn close(&self) {
        crate::impl_db_dispatch!(self, {
            MySql(p) => p.close().await,
            Postgres(p) => p.close().await,
            SQLite(p) => p.close().await,
        })
    }

    pub fn is_closed(&self) -> bool {
        crate::impl_db_dispatch!(self, {
            MySql(p) => p.is_closed(),
            Postgres(p) => p.is_closed(),
            SQLite(p) => p.is_closed(),
        })
    }

    /// Get the engine behind this pool.
    pub fn engine(&self) -> Engine {
        match self {
            DbPool::MySql(_) => Engine::MySql,
            DbPool::Postgres(_) => Engine::Postgres,
            DbPool::SQLite(_) => Engine::Sqlite,
        }
    }
}

/// Opens and closes pools for targets. The registry is generic over this so
/// tests can count handshakes without a database server.
pub trait Connector: Send + Sync + 'static {
    type Pool: Clone + Send + Sync + 'static;

    /// Perform the handshake. `secret` is consumed and dropped when this returns.
    fn connect(
        &self,
        target: &ConnectionTarget,
        secret: Secret,
    ) -> impl Future<Output = PortalResult<Self::Pool>> + Send;

    fn is_open(&self, pool: &Self::Pool) -> bool;

    fn close(&self, pool: &Self::Pool) -> impl Future<Output = ()> + Send;
}

/// Production connector backed by sqlx pools.
#[derive(Debug, Clone, Default)]
pub struct SqlxConnector {
    options: PoolOptions,
}

impl SqlxConnector {
    pub fn new(options: PoolOptions) -> Self {
        Self { options }
    }

    async fn create_pool(&self, target: &ConnectionTarget, secret: Secret) -> PortalResult<DbPool> {
        let opts = &self.options;
        let is_sqlite = target.engine == Engine::Sqlite;
        let acquire_timeout = Duration::from_secs(opts.acquire_timeout_or_default());
        let idle_timeout = Some(Duration::from_secs(opts.idle_timeout_or_default()));

        match target.engine {
            Engine::MySql => {
                let mut options = MySqlConnectOptions::new()
                    .host(&target.host)
                    .username(&target.user)
                    .password(secret.expose())
                    .database(&target.database)
                    .charset("utf8mb4")
                    .ssl_mode(mysql_ssl_mode(target.tls));
                if let Some(port) = target.port {
                    options = options.port(port);
                }
                drop(secret);

                let pool = MySqlPoolOptions::new()
                    .min_connections(opts.min_connections_or_default())
                    .max_connections(opts.max_connections_or_default(is_sqlite))
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(opts.test_before_acquire_or_default())
                    .connect_with(options)
                    .await
                    .map_err(|e| classify_connect_error(target.engine, &e))?;
                Ok(DbPool::MySql(pool))
            }
            Engine::Postgres => {
                let mut options = PgConnectOptions::new()
                    .host(&target.host)
                    .username(&target.user)
                    .password(secret.expose())
                    .database(&target.database)
                    .ssl_mode(pg_ssl_mode(target.tls));
                if let Some(port) = target.port {
                    options = options.port(port);
                }
                drop(secret);

                let pool = PgPoolOptions::new()
                    .min_connections(opts.min_connections_or_default())
                    .max_connections(opts.max_connections_or_default(is_sqlite))
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(opts.test_before_acquire_or_default())
                    .connect_with(options)
                    .await
                    .map_err(|e| classify_connect_error(target.engine, &e))?;
                Ok(DbPool::Postgres(pool))
            }
            Engine::Sqlite => {
                drop(secret);
                let options = SqliteConnectOptions::new()
                    .filename(&target.database)
                    .create_if_missing(true)
                    .foreign_keys(true);

                let pool = SqlitePoolOptions::new()
                    .min_connections(opts.min_connections_or_default())
                    .max_connections(opts.max_connections_or_default(is_sqlite))
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(opts.test_before_acquire_or_default())
                    .connect_with(options)
                    .await
                    .map_err(|e| classify_connect_error(target.engine, &e))?;
                Ok(DbPool::SQLite(pool))
            }
        }
    }
}

impl Connector for SqlxConnector {
    type Pool = DbPool;

    async fn connect(&self, target: &ConnectionTarget, secret: Secret) -> PortalResult<DbPool> {
        info!(target = %target.summary(), "Opening connection pool");
        let pool = self.create_pool(target, secret).await?;
        debug!(target = %target.summary(), "Connection pool ready");
        Ok(pool)
    }

    fn is_open(&self, pool: &DbPool) -> bool {
        !pool.is_closed()
    }

    async fn close(&self, pool: &DbPool) {
        pool.close().await
    }
}

fn mysql_ssl_mode(tls: TlsPolicy) -> MySqlSslMode {
    match tls {
        TlsPolicy::Disabled => MySqlSslMode::Disabled,
        TlsPolicy::Preferred => MySqlSslMode::Preferred,
        TlsPolicy::Required {
            trust_server_certificate: true,
        } => MySqlSslMode::Required,
        TlsPolicy::Required {
            trust_server_certificate: false,
        } => MySqlSslMode::VerifyIdentity,
    }
}

fn pg_ssl_mode(tls: TlsPolicy) -> PgSslMode {
    match tls {
        TlsPolicy::Disabled => PgSslMode::Disable,
        TlsPolicy::Preferred => PgSslMode::Prefer,
        TlsPolicy::Required {
            trust_server_certificate: true,
        } => PgSslMode::Require,
        TlsPolicy::Required {
            trust_server_certificate: false,
        } => PgSslMode::VerifyFull,
    }
}

/// Classify a failed handshake.
///
/// Server codes are checked first (MySQL 1045 / Postgres 28xxx for bad
/// credentials); message heuristics cover drivers that only give text.
pub fn classify_connect_error(engine: Engine, error: &sqlx::Error) -> PortalError {
    let kind = match error {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("1045") | Some("28P01") | Some("28000") => ConnectionErrorKind::BadCredentials,
            Some("1049") | Some("3D000") => ConnectionErrorKind::Configuration,
            _ => kind_from_message(error),
        },
        sqlx::Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::TimedOut => {
            ConnectionErrorKind::Timeout
        }
        sqlx::Error::Io(_) => ConnectionErrorKind::Unreachable,
        sqlx::Error::Tls(_) => ConnectionErrorKind::Tls,
        sqlx::Error::PoolTimedOut => ConnectionErrorKind::Timeout,
        sqlx::Error::PoolClosed => ConnectionErrorKind::Closed,
        sqlx::Error::Configuration(_) => ConnectionErrorKind::Configuration,
        _ => kind_from_message(error),
    };

    PortalError::connection(
        kind,
        format!("Failed to connect: {}", error),
        connection_suggestion(engine, kind),
    )
}

fn kind_from_message(error: &sqlx::Error) -> ConnectionErrorKind {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("access denied")
        || error_str.contains("authentication")
        || error_str.contains("password")
    {
        ConnectionErrorKind::BadCredentials
    } else if error_str.contains("connection refused") || error_str.contains("no route to host") {
        ConnectionErrorKind::Unreachable
    } else if error_str.contains("tls") || error_str.contains("ssl") {
        ConnectionErrorKind::Tls
    } else if error_str.contains("timed out") {
        ConnectionErrorKind::Timeout
    } else if error_str.contains("unknown database") || error_str.contains("does not exist") {
        ConnectionErrorKind::Configuration
    } else {
        ConnectionErrorKind::Other
    }
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(engine: Engine, kind: ConnectionErrorKind) -> String {
    match kind {
        ConnectionErrorKind::BadCredentials => {
            "Verify the user name and the secret registered for this target".to_string()
        }
        ConnectionErrorKind::Unreachable => format!(
            "Check that the {} server is running and reachable from the gateway",
            engine
        ),
        ConnectionErrorKind::Tls => {
            "Check the encrypt and trust-server-certificate settings".to_string()
        }
        ConnectionErrorKind::Timeout => {
            "The server did not answer in time; retry or raise the connect timeout".to_string()
        }
        ConnectionErrorKind::Configuration => match engine {
            Engine::Sqlite => "Verify the file path exists and is writable".to_string(),
            _ => "Check that the database name exists on the server".to_string(),
        },
        ConnectionErrorKind::Closed => "Acquire the target again".to_string(),
        ConnectionErrorKind::Other => format!("Check {} server compatibility and logs", engine),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_modes() {
        assert!(matches!(
            mysql_ssl_mode(TlsPolicy::Required {
                trust_server_certificate: false
            }),
            MySqlSslMode::VerifyIdentity
        ));
        assert!(matches!(
            pg_ssl_mode(TlsPolicy::Required {
                trust_server_certificate: true
            }),
            PgSslMode::Require
        ));
        assert!(matches!(pg_ssl_mode(TlsPolicy::Disabled), PgSslMode::Disable));
    }

    #[test]
    fn test_classify_io_errors() {
        let refused = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        let err = classify_connect_error(Engine::MySql, &refused);
        assert!(matches!(
            err,
            PortalError::Connection {
                kind: ConnectionErrorKind::Unreachable,
                ..
            }
        ));
        assert!(err.is_retryable());

        let timed_out = sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(
            classify_connect_error(Engine::Postgres, &timed_out),
            PortalError::Connection {
                kind: ConnectionErrorKind::Timeout,
                ..
            }
        ));
    }

    #[test]
    fn test_classify_by_message() {
        let err = sqlx::Error::Protocol("Access denied for user 'portal'".into());
        assert!(matches!(
            classify_connect_error(Engine::MySql, &err),
            PortalError::Connection {
                kind: ConnectionErrorKind::BadCredentials,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_sqlite_connector_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");
        let target = ConnectionTarget::sqlite(path.to_string_lossy());

        let connector = SqlxConnector::default();
        let pool = connector.connect(&target, Secret::empty()).await.unwrap();
        assert_eq!(pool.engine(), Engine::Sqlite);
        assert!(connector.is_open(&pool));

        connector.close(&pool).await;
        assert!(!connector.is_open(&pool));
    }
}
