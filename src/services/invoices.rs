use super::notifications::notify_in;
use super::{PortalServices, StoreTransaction, decode_all, decode_one, new_id, timestamp};
use crate::db::{Connector, SqlBackend, SqlTransaction};
use crate::error::{ExecutionClass, PortalError, PortalResult};
use crate::models::{
    ADMIN_RECIPIENT, Invoice, InvoiceFilter, InvoiceStatus, NewInvoice, Statement, StatusChange,
    supplier_recipient,
};
use crate::sat::{CfdiQuery, SatStatus};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

const INVOICE_COLUMNS: &str = "id, company_id, supplier_id, purchase_order_id, uuid, issuer_rfc, \
     receiver_rfc, total, currency, status, sat_status, status_reason, submitted_at, updated_at";

const DEFAULT_CURRENCY: &str = "MXN";

/// Outcome of a pending-invoice sweep for one company.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RevalidationSummary {
    pub checked: usize,
    pub validated: usize,
    pub rejected: usize,
    pub still_pending: usize,
    pub failed: usize,
}

/// Status an invoice moves to after SAT answers, and the reason recorded with it.
///
/// Validation never downgrades an approved invoice and never re-opens one.
fn apply_sat(current: InvoiceStatus, sat: &SatStatus) -> (InvoiceStatus, Option<String>) {
    match sat {
        SatStatus::Vigente if current == InvoiceStatus::Pendiente => (InvoiceStatus::Validada, None),
        SatStatus::Vigente => (current, None),
        SatStatus::Cancelado => (
            InvoiceStatus::Rechazada,
            Some("CFDI cancelado ante el SAT".to_string()),
        ),
        SatStatus::NoEncontrado => (
            InvoiceStatus::Rechazada,
            Some("CFDI no encontrado en el SAT".to_string()),
        ),
        SatStatus::Error { reason } => (current, Some(reason.clone())),
    }
}

/// Admin transitions. Payments move invoices to `Pagada`, never this path.
fn can_transition(from: InvoiceStatus, to: InvoiceStatus) -> bool {
    use InvoiceStatus::*;
    matches!(
        (from, to),
        (Validada, Aprobada) | (Pendiente, Rechazada) | (Validada, Rechazada) | (Aprobada, Rechazada)
    )
}

impl<C> PortalServices<C>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    /// Store a supplier's CFDI and validate it with SAT.
    ///
    /// A cancelled or unknown CFDI is stored as `Rechazada`; an unreachable
    /// SAT leaves it `Pendiente` for the scheduler to retry.
    pub async fn submit_invoice(&self, company_id: &str, new: NewInvoice) -> PortalResult<Invoice> {
        self.require_tenant(company_id)?;
        let supplier = self.get_supplier(company_id, &new.supplier_id).await?;
        if !supplier.active {
            return Err(PortalError::invalid_input(format!(
                "Supplier {} is inactive",
                supplier.id
            )));
        }

        let query = CfdiQuery::new(
            new.uuid.trim().to_uppercase(),
            new.issuer_rfc.trim().to_uppercase(),
            new.receiver_rfc.trim().to_uppercase(),
            new.total,
        );
        query.validate()?;
        if query.issuer_rfc != supplier.rfc {
            return Err(PortalError::invalid_input(format!(
                "Issuer RFC {} does not match supplier RFC {}",
                query.issuer_rfc, supplier.rfc
            )));
        }

        let existing = self
            .store
            .fetch(
                Statement::new("SELECT id FROM invoices WHERE company_id = ? AND uuid = ?")
                    .bind(company_id)
                    .bind(&query.uuid),
            )
            .await?;
        if !existing.is_empty() {
            return Err(PortalError::execution(
                None,
                format!("CFDI {} was already submitted", query.uuid),
                ExecutionClass::Constraint,
            ));
        }

        let sat = self.sat.verify(&query).await;
        let (status, reason) = apply_sat(InvoiceStatus::Pendiente, &sat);

        let id = new_id();
        let now = timestamp(Utc::now());
        let po_sql = if new.purchase_order_id.is_some() { "?" } else { "NULL" };
        let stmt = Statement::new(format!(
            "INSERT INTO invoices ({}) VALUES (?, ?, ?, {}, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            INVOICE_COLUMNS, po_sql
        ))
        .bind(&id)
        .bind(company_id)
        .bind(&supplier.id);
        let stmt = match new.purchase_order_id {
            Some(po) => stmt.bind(po),
            None => stmt,
        };
        let stmt = stmt
            .bind(&query.uuid)
            .bind(&query.issuer_rfc)
            .bind(&query.receiver_rfc)
            .bind(query.total)
            .bind(new.currency.unwrap_or_else(|| DEFAULT_CURRENCY.to_string()))
            .bind(status.as_str())
            .bind(sat.label())
            .bind(reason.clone())
            .bind(&now)
            .bind(&now);

        let mut tx = self.store.begin().await?;
        tx.execute(stmt).await?;
        notify_in(
            &mut tx,
            company_id,
            ADMIN_RECIPIENT,
            "invoice_submitted",
            &format!("Nueva factura de {}", supplier.name),
            Some(format!("CFDI {} ({})", query.uuid, status)),
        )
        .await?;
        if status == InvoiceStatus::Rechazada {
            notify_rejection(&mut tx, company_id, &supplier.id, &query.uuid, reason.as_deref())
                .await?;
        }
        tx.commit().await?;

        info!(
            company_id,
            invoice_id = %id,
            uuid = %query.uuid,
            sat_status = sat.label(),
            status = %status,
            "Invoice submitted"
        );

        self.get_invoice(company_id, &id).await
    }

    pub async fn get_invoice(&self, company_id: &str, id: &str) -> PortalResult<Invoice> {
        self.require_tenant(company_id)?;
        let rows = self
            .store
            .fetch(
                Statement::new(format!(
                    "SELECT {} FROM invoices WHERE company_id = ? AND id = ?",
                    INVOICE_COLUMNS
                ))
                .bind(company_id)
                .bind(id),
            )
            .await?;
        decode_one(rows, "invoice", id)
    }

    pub async fn list_invoices(
        &self,
        company_id: &str,
        filter: InvoiceFilter,
    ) -> PortalResult<Vec<Invoice>> {
        self.require_tenant(company_id)?;
        let stmt = Statement::new(format!(
            "SELECT {} FROM invoices WHERE company_id = ?",
            INVOICE_COLUMNS
        ))
        .bind(company_id)
        .push_opt(" AND supplier_id = ?", filter.supplier_id)
        .push_opt(" AND status = ?", filter.status.map(|s| s.as_str()))
        .push_opt(" AND submitted_at >= ?", filter.from.map(timestamp))
        .push_opt(" AND submitted_at <= ?", filter.to.map(timestamp))
        .push(" ORDER BY submitted_at DESC");
        decode_all(self.store.fetch(stmt).await?)
    }

    /// Admin approval or rejection.
    pub async fn update_invoice_status(
        &self,
        company_id: &str,
        id: &str,
        change: StatusChange,
    ) -> PortalResult<Invoice> {
        let invoice = self.get_invoice(company_id, id).await?;
        if !can_transition(invoice.status, change.status) {
            return Err(PortalError::invalid_input(format!(
                "Invoice {} cannot move from {} to {}",
                id, invoice.status, change.status
            )));
        }

        let mut tx = self.store.begin().await?;
        let changed = tx
            .execute(
                Statement::new(
                    "UPDATE invoices SET status = ?, status_reason = ?, updated_at = ? \
                     WHERE company_id = ? AND id = ? AND status = ?",
                )
                .bind(change.status.as_str())
                .bind(change.reason.clone())
                .bind(timestamp(Utc::now()))
                .bind(company_id)
                .bind(id)
                .bind(invoice.status.as_str()),
            )
            .await?;
        if changed == 0 {
            return Err(changed_concurrently(id));
        }

        let title = match change.status {
            InvoiceStatus::Aprobada => "Factura aprobada",
            _ => "Factura rechazada",
        };
        notify_in(
            &mut tx,
            company_id,
            &supplier_recipient(&invoice.supplier_id),
            "invoice_status",
            title,
            Some(match &change.reason {
                Some(reason) => format!("CFDI {}: {}", invoice.uuid, reason),
                None => format!("CFDI {}", invoice.uuid),
            }),
        )
        .await?;
        tx.commit().await?;

        info!(company_id, invoice_id = id, from = %invoice.status, to = %change.status, "Invoice status changed");

        self.get_invoice(company_id, id).await
    }

    /// Ask SAT again about an invoice and store the answer.
    ///
    /// When SAT cannot be consulted the answer is still recorded and the
    /// call fails with `ServiceUnavailable`.
    pub async fn revalidate_invoice(&self, company_id: &str, id: &str) -> PortalResult<Invoice> {
        let (invoice, sat) = self.refresh_sat_status(company_id, id).await?;
        match sat {
            SatStatus::Error { reason } => Err(PortalError::service_unavailable("SAT", reason)),
            _ => Ok(invoice),
        }
    }

    async fn refresh_sat_status(
        &self,
        company_id: &str,
        id: &str,
    ) -> PortalResult<(Invoice, SatStatus)> {
        let invoice = self.get_invoice(company_id, id).await?;
        if matches!(invoice.status, InvoiceStatus::Pagada | InvoiceStatus::Rechazada) {
            return Err(PortalError::invalid_input(format!(
                "Invoice {} is {} and cannot be revalidated",
                id, invoice.status
            )));
        }

        let query = CfdiQuery::new(
            &invoice.uuid,
            &invoice.issuer_rfc,
            &invoice.receiver_rfc,
            invoice.total,
        );
        let sat = self.sat.verify(&query).await;
        let (status, reason) = apply_sat(invoice.status, &sat);

        let mut tx = self.store.begin().await?;
        let changed = tx
            .execute(
                Statement::new(
                    "UPDATE invoices SET status = ?, sat_status = ?, status_reason = ?, updated_at = ? \
                     WHERE company_id = ? AND id = ? AND status = ?",
                )
                .bind(status.as_str())
                .bind(sat.label())
                .bind(reason.clone())
                .bind(timestamp(Utc::now()))
                .bind(company_id)
                .bind(id)
                .bind(invoice.status.as_str()),
            )
            .await?;
        if changed == 0 {
            return Err(changed_concurrently(id));
        }
        if status == InvoiceStatus::Rechazada {
            notify_rejection(
                &mut tx,
                company_id,
                &invoice.supplier_id,
                &invoice.uuid,
                reason.as_deref(),
            )
            .await?;
        }
        tx.commit().await?;

        if status != invoice.status {
            info!(company_id, invoice_id = id, from = %invoice.status, to = %status, "Invoice revalidated");
        }

        Ok((self.get_invoice(company_id, id).await?, sat))
    }

    /// Revalidate up to `limit` pending invoices, oldest first.
    ///
    /// A failure on one invoice is logged and counted; the sweep continues.
    pub async fn revalidate_pending(
        &self,
        company_id: &str,
        limit: u32,
    ) -> PortalResult<RevalidationSummary> {
        self.require_tenant(company_id)?;
        let rows = self
            .store
            .fetch(
                Statement::new(
                    "SELECT id FROM invoices WHERE company_id = ? AND status = ? \
                     ORDER BY submitted_at LIMIT ?",
                )
                .bind(company_id)
                .bind(InvoiceStatus::Pendiente.as_str())
                .bind(i64::from(limit)),
            )
            .await?;

        let mut summary = RevalidationSummary::default();
        for row in rows {
            let Some(id) = row.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            summary.checked += 1;
            match self.refresh_sat_status(company_id, id).await {
                Ok((invoice, _)) => match invoice.status {
                    InvoiceStatus::Validada => summary.validated += 1,
                    InvoiceStatus::Rechazada => summary.rejected += 1,
                    _ => summary.still_pending += 1,
                },
                Err(err) => {
                    warn!(company_id, invoice_id = id, error = %err, "Revalidation failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}

async fn notify_rejection<T: SqlTransaction>(
    tx: &mut StoreTransaction<T>,
    company_id: &str,
    supplier_id: &str,
    uuid: &str,
    reason: Option<&str>,
) -> PortalResult<()> {
    notify_in(
        tx,
        company_id,
        &supplier_recipient(supplier_id),
        "invoice_rejected",
        "Factura rechazada",
        Some(match reason {
            Some(reason) => format!("CFDI {}: {}", uuid, reason),
            None => format!("CFDI {}", uuid),
        }),
    )
    .await
}

fn changed_concurrently(id: &str) -> PortalError {
    PortalError::invalid_input(format!("Invoice {} changed while it was being updated", id))
}

/// `Validation` error for an invoice SAT has cancelled or does not know.
pub(super) fn sat_rejection(invoice: &Invoice) -> Option<PortalError> {
    let sat_status = invoice.sat_status.as_deref()?;
    let rejected = invoice.status == InvoiceStatus::Rechazada
        && (sat_status == SatStatus::Cancelado.label() || sat_status == SatStatus::NoEncontrado.label());
    rejected.then(|| PortalError::validation(&invoice.uuid, sat_status))
}
