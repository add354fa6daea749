//! Domain access functions.
//!
//! `PortalServices` composes the tenant resolver, the connection registry, the
//! procedure invoker, the portal store and the SAT client. Each entity lives
//! in its own submodule as an `impl` block on the same type:
//! - `suppliers`: portal suppliers backed by the ERP `Prov` table
//! - `purchase_orders`: ERP `Compra` reads and remission generation
//! - `invoices`: CFDI submission and SAT validation
//! - `payments`: payments against validated invoices
//! - `messages` / `notifications`: admin and supplier messaging
//!
//! Every portal row is scoped by company id. ERP reads retry once after a
//! transient connection failure; writes and procedures are never retried.

mod invoices;
mod messages;
mod notifications;
mod payments;
mod purchase_orders;
mod store;
mod suppliers;

pub use invoices::RevalidationSummary;
pub use purchase_orders::REMISSION_PROCEDURE;
pub use store::{PortalStore, StoreTransaction};

use crate::db::{ConnectionRegistry, Connector, SqlBackend};
use crate::error::{ConnectionErrorKind, PortalError, PortalResult};
use crate::invoker::ProcedureInvoker;
use crate::models::{ConnectionTarget, Record, Statement, TenantContext};
use crate::sat::SatClient;
use crate::tenant::{TenantDirectory, TenantResolver};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Entry point for every domain operation.
pub struct PortalServices<C: Connector> {
    registry: ConnectionRegistry<C>,
    resolver: Arc<TenantResolver>,
    invoker: ProcedureInvoker<C>,
    sat: SatClient,
    store: PortalStore<C>,
    query_timeout: Duration,
}

impl<C: Connector> Clone for PortalServices<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            resolver: Arc::clone(&self.resolver),
            invoker: self.invoker.clone(),
            sat: self.sat.clone(),
            store: self.store.clone(),
            query_timeout: self.query_timeout,
        }
    }
}

impl<C> PortalServices<C>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    pub fn new(
        registry: ConnectionRegistry<C>,
        resolver: Arc<TenantResolver>,
        invoker: ProcedureInvoker<C>,
        sat: SatClient,
        portal: ConnectionTarget,
        query_timeout: Duration,
    ) -> Self {
        let store = PortalStore::new(registry.clone(), portal, query_timeout);
        Self {
            registry,
            resolver,
            invoker,
            sat,
            store,
            query_timeout,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry<C> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<TenantResolver> {
        &self.resolver
    }

    pub fn invoker(&self) -> &ProcedureInvoker<C> {
        &self.invoker
    }

    pub fn store(&self) -> &PortalStore<C> {
        &self.store
    }

    /// Create the portal tables if they do not exist.
    pub async fn migrate(&self) -> PortalResult<()> {
        self.store.migrate().await
    }

    /// Swap the tenant directory and close pools for targets it no longer uses.
    ///
    /// Returns how many targets were released.
    pub async fn reload_tenants(&self, directory: TenantDirectory) -> usize {
        let stale = self.resolver.replace(directory);
        for target in &stale {
            self.registry.release(target).await;
            self.invoker.forget_target(target).await;
        }
        stale.len()
    }

    /// Reject unknown and inactive companies before touching portal rows.
    fn require_tenant(&self, company_id: &str) -> PortalResult<TenantContext> {
        self.resolver.resolve(company_id)
    }

    /// Read from the tenant's ERP database.
    ///
    /// `build` receives the resolved context so it can apply the row filter.
    /// A retryable connection failure re-resolves the tenant and tries exactly
    /// once more. The target's pool is released first only when the
    /// connection itself is gone; a slow query leaves the shared pool alone.
    async fn erp_fetch<F>(&self, company_id: &str, build: F) -> PortalResult<Vec<Record>>
    where
        F: Fn(&TenantContext) -> Statement + Send + Sync,
    {
        let ctx = self.resolver.resolve(company_id)?;
        match self.erp_fetch_once(&ctx, &build).await {
            Err(err) if err.is_connection() && err.is_retryable() => {
                warn!(
                    company_id,
                    target = %ctx.target().summary(),
                    error = %err,
                    "ERP read failed, retrying once"
                );
                if matches!(
                    err.connection_kind(),
                    Some(ConnectionErrorKind::Unreachable | ConnectionErrorKind::Closed)
                ) {
                    self.registry.release(ctx.target()).await;
                }
                let ctx = self.resolver.resolve(company_id)?;
                self.erp_fetch_once(&ctx, &build).await
            }
            other => other,
        }
    }

    async fn erp_fetch_once<F>(&self, ctx: &TenantContext, build: &F) -> PortalResult<Vec<Record>>
    where
        F: Fn(&TenantContext) -> Statement + Send + Sync,
    {
        let backend = self.registry.acquire(ctx.target()).await?;
        backend.fetch_all(&build(ctx), self.query_timeout).await
    }
}

// =============================================================================
// Common Helper Functions
// =============================================================================

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort as strings
/// on every engine.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode<T: DeserializeOwned>(record: Record) -> PortalResult<T> {
    serde_json::from_value(serde_json::Value::Object(record))
        .map_err(|e| PortalError::internal(format!("Failed to decode row: {}", e)))
}

fn decode_all<T: DeserializeOwned>(records: Vec<Record>) -> PortalResult<Vec<T>> {
    records.into_iter().map(decode).collect()
}

fn decode_one<T: DeserializeOwned>(
    records: Vec<Record>,
    entity: &str,
    id: &str,
) -> PortalResult<T> {
    records
        .into_iter()
        .next()
        .ok_or_else(|| PortalError::not_found(entity, id))
        .and_then(decode)
}

fn require_text(field: &str, value: &str) -> PortalResult<()> {
    if value.trim().is_empty() {
        return Err(PortalError::invalid_input(format!("{} cannot be empty", field)));
    }
    Ok(())
}
