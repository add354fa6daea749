//! Statement execution.
//!
//! `SqlBackend` is the seam between the gateway and a live database: raw
//! parameterized statements, catalog lookups and routine calls. `DbPool`
//! implements it with database-specific submodules:
//! - `mysql`: MySQL-specific fetch and write operations
//! - `postgres`: PostgreSQL-specific fetch and write operations
//! - `sqlite`: SQLite-specific fetch and write operations
//!
//! `SqlTransaction` runs several statements atomically on one connection;
//! `DbTransaction` is its sqlx-backed implementation.
//!
//! Every call is bounded by a timeout; expiry is reported as a connection
//! timeout, never as data.

use crate::db::catalog;
use crate::db::pool::DbPool;
use crate::db::types::RowToRecord;
use crate::error::{PortalError, PortalResult};
use crate::models::{
    BoundArg, Engine, ProcedureName, ProcedureSignature, Record, ResultSet, Statement,
};
use futures_util::TryStreamExt;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Operations the gateway needs from a database.
pub trait SqlBackend: Clone + Send + Sync + 'static {
    fn engine(&self) -> Engine;

    /// Run a query and return every row.
    fn fetch_all(
        &self,
        stmt: &Statement,
        timeout: Duration,
    ) -> impl Future<Output = PortalResult<Vec<Record>>> + Send;

    /// Run a write and return the number of affected rows.
    fn execute(
        &self,
        stmt: &Statement,
        timeout: Duration,
    ) -> impl Future<Output = PortalResult<u64>> + Send;

    /// Look up a routine in the catalog. `None` when it does not exist.
    ///
    /// Unbounded here; the invoker applies its query timeout.
    fn describe_procedure(
        &self,
        name: &ProcedureName,
    ) -> impl Future<Output = PortalResult<Option<ProcedureSignature>>> + Send;

    /// Call a routine with arguments already ordered by catalog ordinal.
    fn call_procedure(
        &self,
        signature: &ProcedureSignature,
        args: &[BoundArg],
        timeout: Duration,
    ) -> impl Future<Output = PortalResult<Vec<ResultSet>>> + Send;

    type Transaction: SqlTransaction;

    /// Open a transaction on a dedicated connection.
    fn begin(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = PortalResult<Self::Transaction>> + Send;
}

/// An open transaction. Dropping it without `commit` rolls it back.
pub trait SqlTransaction: Send + Sized {
    fn fetch_all(
        &mut self,
        stmt: &Statement,
        timeout: Duration,
    ) -> impl Future<Output = PortalResult<Vec<Record>>> + Send;

    fn execute(
        &mut self,
        stmt: &Statement,
        timeout: Duration,
    ) -> impl Future<Output = PortalResult<u64>> + Send;

    fn commit(self, timeout: Duration) -> impl Future<Output = PortalResult<()>> + Send;
}

/// Transaction handle for each supported database type.
pub enum DbTransaction {
    MySql(sqlx::Transaction<'static, sqlx::MySql>),
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
    SQLite(sqlx::Transaction<'static, sqlx::Sqlite>),
}

impl SqlBackend for DbPool {
    fn engine(&self) -> Engine {
        DbPool::engine(self)
    }

    async fn fetch_all(&self, stmt: &Statement, query_timeout: Duration) -> PortalResult<Vec<Record>> {
        debug!(sql = %stmt.sql(), params = stmt.params().len(), "Executing query");
        crate::impl_db_dispatch!(self, {
            MySql(p) => mysql::fetch_all(p, stmt, query_timeout).await,
            Postgres(p) => postgres::fetch_all(p, stmt, query_timeout).await,
            SQLite(p) => sqlite::fetch_all(p, stmt, query_timeout).await,
        })
    }

    async fn execute(&self, stmt: &Statement, query_timeout: Duration) -> PortalResult<u64> {
        debug!(sql = %stmt.sql(), params = stmt.params().len(), "Executing write operation");
        crate::impl_db_dispatch!(self, {
            MySql(p) => mysql::execute(p, stmt, query_timeout).await,
            Postgres(p) => postgres::execute(p, stmt, query_timeout).await,
            SQLite(p) => sqlite::execute(p, stmt, query_timeout).await,
        })
    }

    async fn describe_procedure(&self, name: &ProcedureName) -> PortalResult<Option<ProcedureSignature>> {
        catalog::describe(self, name).await
    }

    async fn call_procedure(
        &self,
        signature: &ProcedureSignature,
        args: &[BoundArg],
        query_timeout: Duration,
    ) -> PortalResult<Vec<ResultSet>> {
        catalog::call(self, signature, args, query_timeout).await
    }

    type Transaction = DbTransaction;

    async fn begin(&self, query_timeout: Duration) -> PortalResult<DbTransaction> {
        debug!("Beginning transaction");
        let begun = match self {
            DbPool::MySql(p) => timeout(query_timeout, p.begin())
                .await
                .map(|tx| tx.map(DbTransaction::MySql)),
            DbPool::Postgres(p) => timeout(query_timeout, p.begin())
                .await
                .map(|tx| tx.map(DbTransaction::Postgres)),
            DbPool::SQLite(p) => timeout(query_timeout, p.begin())
                .await
                .map(|tx| tx.map(DbTransaction::SQLite)),
        };
        match begun {
            Ok(tx) => Ok(tx?),
            Err(_) => Err(timeout_error("begin transaction", query_timeout)),
        }
    }
}

impl SqlTransaction for DbTransaction {
    async fn fetch_all(&mut self, stmt: &Statement, query_timeout: Duration) -> PortalResult<Vec<Record>> {
        debug!(sql = %stmt.sql(), params = stmt.params().len(), "Executing query in transaction");
        match self {
            Self::MySql(tx) => mysql::fetch_all_in(tx, stmt, query_timeout).await,
            Self::Postgres(tx) => postgres::fetch_all_in(tx, stmt, query_timeout).await,
            Self::SQLite(tx) => sqlite::fetch_all_in(tx, stmt, query_timeout).await,
        }
    }

    async fn execute(&mut self, stmt: &Statement, query_timeout: Duration) -> PortalResult<u64> {
        debug!(sql = %stmt.sql(), params = stmt.params().len(), "Executing write in transaction");
        match self {
            Self::MySql(tx) => mysql::execute_in(tx, stmt, query_timeout).await,
            Self::Postgres(tx) => postgres::execute_in(tx, stmt, query_timeout).await,
            Self::SQLite(tx) => sqlite::execute_in(tx, stmt, query_timeout).await,
        }
    }

    async fn commit(self, query_timeout: Duration) -> PortalResult<()> {
        let committed = match self {
            Self::MySql(tx) => timeout(query_timeout, tx.commit()).await,
            Self::Postgres(tx) => timeout(query_timeout, tx.commit()).await,
            Self::SQLite(tx) => timeout(query_timeout, tx.commit()).await,
        };
        match committed {
            Ok(done) => Ok(done?),
            Err(_) => Err(timeout_error("commit", query_timeout)),
        }
    }
}

// =============================================================================
// Common Helper Functions
// =============================================================================

pub(crate) fn timeout_error(operation: &str, limit: Duration) -> PortalError {
    PortalError::timeout(operation, limit.as_secs())
}

fn to_records<R: RowToRecord>(rows: Vec<R>) -> Vec<Record> {
    rows.iter().map(RowToRecord::to_record).collect()
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// The code structure is intentionally parallel to make differences obvious.

mod mysql {
    use super::*;
    use crate::db::params::bind_mysql_value;
    use sqlx::{MySql, MySqlPool, Transaction};

    pub async fn fetch_all(
        pool: &MySqlPool,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> PortalResult<Vec<Record>> {
        // Without params, use raw SQL to avoid prepared statement issues
        let rows_future = async {
            if stmt.params().is_empty() {
                use sqlx::Executor;
                pool.fetch(stmt.sql()).try_collect::<Vec<_>>().await
            } else {
                let mut query = sqlx::query(stmt.sql());
                for param in stmt.params() {
                    query = bind_mysql_value(query, param);
                }
                query.fetch(pool).try_collect::<Vec<_>>().await
            }
        };

        match timeout(query_timeout, rows_future).await {
            Ok(rows) => Ok(to_records(rows?)),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute(
        pool: &MySqlPool,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> PortalResult<u64> {
        let result = if stmt.params().is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, pool.execute(stmt.sql())).await
        } else {
            let mut query = sqlx::query(stmt.sql());
            for param in stmt.params() {
                query = bind_mysql_value(query, param);
            }
            timeout(query_timeout, query.execute(pool)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(PortalError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }

    pub async fn fetch_all_in(
        tx: &mut Transaction<'static, MySql>,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> PortalResult<Vec<Record>> {
        let mut query = sqlx::query(stmt.sql());
        for param in stmt.params() {
            query = bind_mysql_value(query, param);
        }

        match timeout(query_timeout, query.fetch_all(&mut **tx)).await {
            Ok(rows) => Ok(to_records(rows?)),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute_in(
        tx: &mut Transaction<'static, MySql>,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> PortalResult<u64> {
        let mut query = sqlx::query(stmt.sql());
        for param in stmt.params() {
            query = bind_mysql_value(query, param);
        }

        match timeout(query_timeout, query.execute(&mut **tx)).await {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(PortalError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

mod postgres {
    use super::*;
    use crate::db::params::bind_postgres_value;
    use sqlx::{PgPool, Postgres, Transaction};

    pub async fn fetch_all(
        pool: &PgPool,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> PortalResult<Vec<Record>> {
        let sql = stmt.sql_for(Engine::Postgres);
        let rows_future = async {
            if stmt.params().is_empty() {
                use sqlx::Executor;
                pool.fetch(sql.as_ref()).try_collect::<Vec<_>>().await
            } else {
                let mut query = sqlx::query(sql.as_ref());
                for param in stmt.params() {
                    query = bind_postgres_value(query, param);
                }
                query.fetch(pool).try_collect::<Vec<_>>().await
            }
        };

        match timeout(query_timeout, rows_future).await {
            Ok(rows) => Ok(to_records(rows?)),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute(
        pool: &PgPool,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> PortalResult<u64> {
        let sql = stmt.sql_for(Engine::Postgres);
        let result = if stmt.params().is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, pool.execute(sql.as_ref())).await
        } else {
            let mut query = sqlx::query(sql.as_ref());
            for param in stmt.params() {
                query = bind_postgres_value(query, param);
            }
            timeout(query_timeout, query.execute(pool)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(PortalError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }

    pub async fn fetch_all_in(
        tx: &mut Transaction<'static, Postgres>,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> PortalResult<Vec<Record>> {
        let sql = stmt.sql_for(Engine::Postgres);
        let mut query = sqlx::query(sql.as_ref());
        for param in stmt.params() {
            query = bind_postgres_value(query, param);
        }

        match timeout(query_timeout, query.fetch_all(&mut **tx)).await {
            Ok(rows) => Ok(to_records(rows?)),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute_in(
        tx: &mut Transaction<'static, Postgres>,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> PortalResult<u64> {
        let sql = stmt.sql_for(Engine::Postgres);
        let mut query = sqlx::query(sql.as_ref());
        for param in stmt.params() {
            query = bind_postgres_value(query, param);
        }

        match timeout(query_timeout, query.execute(&mut **tx)).await {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(PortalError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::bind_sqlite_value;
    use sqlx::{Sqlite, SqlitePool, Transaction};

    pub async fn fetch_all(
        pool: &SqlitePool,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> PortalResult<Vec<Record>> {
        let rows_future = async {
            let mut query = sqlx::query(stmt.sql());
            for param in stmt.params() {
                query = bind_sqlite_value(query, param);
            }
            query.fetch(pool).try_collect::<Vec<_>>().await
        };

        match timeout(query_timeout, rows_future).await {
            Ok(rows) => Ok(to_records(rows?)),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute(
        pool: &SqlitePool,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> PortalResult<u64> {
        let result = if stmt.params().is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, pool.execute(stmt.sql())).await
        } else {
            let mut query = sqlx::query(stmt.sql());
            for param in stmt.params() {
                query = bind_sqlite_value(query, param);
            }
            timeout(query_timeout, query.execute(pool)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(PortalError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }

    pub async fn fetch_all_in(
        tx: &mut Transaction<'static, Sqlite>,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> PortalResult<Vec<Record>> {
        let mut query = sqlx::query(stmt.sql());
        for param in stmt.params() {
            query = bind_sqlite_value(query, param);
        }

        match timeout(query_timeout, query.fetch_all(&mut **tx)).await {
            Ok(rows) => Ok(to_records(rows?)),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute_in(
        tx: &mut Transaction<'static, Sqlite>,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> PortalResult<u64> {
        let mut query = sqlx::query(stmt.sql());
        for param in stmt.params() {
            query = bind_sqlite_value(query, param);
        }

        match timeout(query_timeout, query.execute(&mut **tx)).await {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(PortalError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionClass;

    async fn sqlite_pool() -> DbPool {
        DbPool::SQLite(sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap())
    }

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_fetch_and_execute_roundtrip() {
        let pool = sqlite_pool().await;
        pool.execute(&Statement::new("CREATE TABLE prov (code TEXT PRIMARY KEY, name TEXT)"), T)
            .await
            .unwrap();
        let inserted = pool
            .execute(
                &Statement::new("INSERT INTO prov (code, name) VALUES (?, ?)")
                    .bind("P001")
                    .bind("Acme"),
                T,
            )
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = pool
            .fetch_all(&Statement::new("SELECT * FROM prov WHERE code = ?").bind("P001"), T)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], serde_json::json!("Acme"));
    }

    #[tokio::test]
    async fn test_constraint_violation_is_business_error() {
        let pool = sqlite_pool().await;
        pool.execute(&Statement::new("CREATE TABLE u (id TEXT PRIMARY KEY)"), T)
            .await
            .unwrap();
        let insert = Statement::new("INSERT INTO u (id) VALUES (?)").bind("a");
        pool.execute(&insert, T).await.unwrap();

        let err = pool.execute(&insert, T).await.unwrap_err();
        assert!(matches!(
            err,
            PortalError::Execution {
                class: ExecutionClass::Constraint,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_transaction_commits_or_rolls_back() {
        let pool = sqlite_pool().await;
        pool.execute(&Statement::new("CREATE TABLE pagos (id TEXT PRIMARY KEY)"), T)
            .await
            .unwrap();

        let mut tx = pool.begin(T).await.unwrap();
        tx.execute(&Statement::new("INSERT INTO pagos (id) VALUES (?)").bind("p1"), T)
            .await
            .unwrap();
        let seen = tx
            .fetch_all(&Statement::new("SELECT id FROM pagos"), T)
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);
        drop(tx);

        let rows = pool.fetch_all(&Statement::new("SELECT id FROM pagos"), T).await.unwrap();
        assert!(rows.is_empty());

        let mut tx = pool.begin(T).await.unwrap();
        tx.execute(&Statement::new("INSERT INTO pagos (id) VALUES (?)").bind("p2"), T)
            .await
            .unwrap();
        tx.commit(T).await.unwrap();

        let rows = pool.fetch_all(&Statement::new("SELECT id FROM pagos"), T).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], serde_json::json!("p2"));
    }

    #[tokio::test]
    async fn test_sqlite_has_no_procedures() {
        let pool = sqlite_pool().await;
        let name = ProcedureName::parse("spGeneraRemisionCompra").unwrap();
        assert!(pool.describe_procedure(&name).await.unwrap().is_none());
    }
}
