//! Portal database access.

use crate::db::{ConnectionRegistry, Connector, SqlBackend, SqlTransaction};
use crate::error::PortalResult;
use crate::models::{ConnectionTarget, Record, Statement};
use std::time::Duration;
use tracing::info;

/// Portable DDL: runs unchanged on MySQL, PostgreSQL and SQLite.
///
/// Timestamps are fixed-width RFC 3339 text; `read` is a reserved word in
/// MySQL so read flags are stored as `is_read`.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "suppliers",
        "CREATE TABLE IF NOT EXISTS suppliers (
            id VARCHAR(64) NOT NULL PRIMARY KEY,
            company_id VARCHAR(64) NOT NULL,
            erp_code VARCHAR(64) NOT NULL,
            rfc VARCHAR(13) NOT NULL,
            name VARCHAR(255) NOT NULL,
            email VARCHAR(255),
            active BOOLEAN NOT NULL,
            created_at VARCHAR(40) NOT NULL,
            updated_at VARCHAR(40) NOT NULL,
            UNIQUE (company_id, erp_code)
        )",
    ),
    (
        "invoices",
        "CREATE TABLE IF NOT EXISTS invoices (
            id VARCHAR(64) NOT NULL PRIMARY KEY,
            company_id VARCHAR(64) NOT NULL,
            supplier_id VARCHAR(64) NOT NULL,
            purchase_order_id BIGINT,
            uuid VARCHAR(36) NOT NULL,
            issuer_rfc VARCHAR(13) NOT NULL,
            receiver_rfc VARCHAR(13) NOT NULL,
            total DOUBLE PRECISION NOT NULL,
            currency VARCHAR(8) NOT NULL,
            status VARCHAR(16) NOT NULL,
            sat_status VARCHAR(32),
            status_reason VARCHAR(1024),
            submitted_at VARCHAR(40) NOT NULL,
            updated_at VARCHAR(40) NOT NULL,
            UNIQUE (company_id, uuid)
        )",
    ),
    (
        "payments",
        "CREATE TABLE IF NOT EXISTS payments (
            id VARCHAR(64) NOT NULL PRIMARY KEY,
            company_id VARCHAR(64) NOT NULL,
            invoice_id VARCHAR(64) NOT NULL,
            supplier_id VARCHAR(64) NOT NULL,
            amount DOUBLE PRECISION NOT NULL,
            reference VARCHAR(255) NOT NULL,
            paid_at VARCHAR(40) NOT NULL,
            created_at VARCHAR(40) NOT NULL
        )",
    ),
    (
        "messages",
        "CREATE TABLE IF NOT EXISTS messages (
            id VARCHAR(64) NOT NULL PRIMARY KEY,
            company_id VARCHAR(64) NOT NULL,
            supplier_id VARCHAR(64) NOT NULL,
            direction VARCHAR(16) NOT NULL,
            sender VARCHAR(255) NOT NULL,
            subject VARCHAR(255) NOT NULL,
            body TEXT NOT NULL,
            is_read BOOLEAN NOT NULL,
            created_at VARCHAR(40) NOT NULL
        )",
    ),
    (
        "notifications",
        "CREATE TABLE IF NOT EXISTS notifications (
            id VARCHAR(64) NOT NULL PRIMARY KEY,
            company_id VARCHAR(64) NOT NULL,
            recipient VARCHAR(128) NOT NULL,
            kind VARCHAR(64) NOT NULL,
            title VARCHAR(255) NOT NULL,
            body TEXT,
            is_read BOOLEAN NOT NULL,
            created_at VARCHAR(40) NOT NULL
        )",
    ),
    (
        "remissions",
        "CREATE TABLE IF NOT EXISTS remissions (
            id VARCHAR(64) NOT NULL PRIMARY KEY,
            company_id VARCHAR(64) NOT NULL,
            purchase_order_id BIGINT NOT NULL,
            erp_id BIGINT,
            folio VARCHAR(64),
            generated_by VARCHAR(255) NOT NULL,
            created_at VARCHAR(40) NOT NULL
        )",
    ),
];

/// Statements against the portal's own database.
pub struct PortalStore<C: Connector> {
    registry: ConnectionRegistry<C>,
    target: ConnectionTarget,
    query_timeout: Duration,
}

impl<C: Connector> Clone for PortalStore<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            target: self.target.clone(),
            query_timeout: self.query_timeout,
        }
    }
}

impl<C> PortalStore<C>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    pub fn new(
        registry: ConnectionRegistry<C>,
        target: ConnectionTarget,
        query_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            target,
            query_timeout,
        }
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub async fn fetch(&self, stmt: Statement) -> PortalResult<Vec<Record>> {
        let backend = self.registry.acquire(&self.target).await?;
        backend.fetch_all(&stmt, self.query_timeout).await
    }

    pub async fn execute(&self, stmt: Statement) -> PortalResult<u64> {
        let backend = self.registry.acquire(&self.target).await?;
        backend.execute(&stmt, self.query_timeout).await
    }

    /// Open a transaction on the portal database.
    pub async fn begin(
        &self,
    ) -> PortalResult<StoreTransaction<<C::Pool as SqlBackend>::Transaction>> {
        let backend = self.registry.acquire(&self.target).await?;
        let tx = backend.begin(self.query_timeout).await?;
        Ok(StoreTransaction {
            tx,
            query_timeout: self.query_timeout,
        })
    }

    pub async fn migrate(&self) -> PortalResult<()> {
        let backend = self.registry.acquire(&self.target).await?;
        for (table, ddl) in MIGRATIONS {
            backend.execute(&Statement::new(*ddl), self.query_timeout).await?;
            tracing::debug!(table, "Portal table ready");
        }
        info!(
            target = %self.target.summary(),
            tables = MIGRATIONS.len(),
            "Portal schema ready"
        );
        Ok(())
    }
}

/// Statements that commit together or not at all.
///
/// Holds its connection until committed or dropped; dropping rolls back.
pub struct StoreTransaction<T> {
    tx: T,
    query_timeout: Duration,
}

impl<T: SqlTransaction> StoreTransaction<T> {
    pub async fn fetch(&mut self, stmt: Statement) -> PortalResult<Vec<Record>> {
        self.tx.fetch_all(&stmt, self.query_timeout).await
    }

    pub async fn execute(&mut self, stmt: Statement) -> PortalResult<u64> {
        self.tx.execute(&stmt, self.query_timeout).await
    }

    pub async fn commit(self) -> PortalResult<()> {
        self.tx.commit(self.query_timeout).await
    }
}
