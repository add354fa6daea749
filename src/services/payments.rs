use super::invoices::sat_rejection;
use super::notifications::notify_in;
use super::{PortalServices, decode_all, decode_one, new_id, require_text, timestamp};
use crate::db::{Connector, SqlBackend};
use crate::error::{PortalError, PortalResult};
use crate::models::{
    InvoiceStatus, NewPayment, Payment, PaymentFilter, Statement, supplier_recipient,
};
use chrono::Utc;
use tracing::info;

const PAYMENT_COLUMNS: &str =
    "id, company_id, invoice_id, supplier_id, amount, reference, paid_at, created_at";

/// Amounts closer than half a centavo are equal.
const AMOUNT_TOLERANCE: f64 = 0.005;

impl<C> PortalServices<C>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    /// Record a payment against a validated or approved invoice.
    ///
    /// The invoice becomes `Pagada` once its outstanding balance reaches zero.
    /// The balance check and every write happen in one transaction that first
    /// claims the invoice row, so concurrent payments on one invoice apply one
    /// at a time.
    pub async fn record_payment(&self, company_id: &str, new: NewPayment) -> PortalResult<Payment> {
        require_text("reference", &new.reference)?;
        if !new.amount.is_finite() || new.amount <= 0.0 {
            return Err(PortalError::invalid_input("Payment amount must be positive"));
        }

        let invoice = self.get_invoice(company_id, &new.invoice_id).await?;
        if let Some(rejection) = sat_rejection(&invoice) {
            return Err(rejection);
        }
        if !invoice.status.is_payable() {
            return Err(not_payable(&invoice.id, invoice.status));
        }

        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        // Claim the row; a payment that settled the invoice meanwhile leaves nothing to claim
        let claimed = tx
            .execute(
                Statement::new(
                    "UPDATE invoices SET updated_at = ? \
                     WHERE company_id = ? AND id = ? AND status IN (?, ?)",
                )
                .bind(timestamp(now))
                .bind(company_id)
                .bind(&invoice.id)
                .bind(InvoiceStatus::Validada.as_str())
                .bind(InvoiceStatus::Aprobada.as_str()),
            )
            .await?;
        if claimed == 0 {
            return Err(PortalError::invalid_input(format!(
                "Invoice {} can no longer receive payments",
                invoice.id
            )));
        }

        let paid: f64 = tx
            .fetch(
                Statement::new("SELECT amount FROM payments WHERE company_id = ? AND invoice_id = ?")
                    .bind(company_id)
                    .bind(&invoice.id),
            )
            .await?
            .iter()
            .filter_map(|row| row.get("amount").and_then(|v| v.as_f64()))
            .sum();
        let outstanding = invoice.total - paid;
        if new.amount > outstanding + AMOUNT_TOLERANCE {
            return Err(PortalError::invalid_input(format!(
                "Payment of {:.2} exceeds the outstanding balance of {:.2}",
                new.amount, outstanding
            )));
        }

        let payment = Payment {
            id: new_id(),
            company_id: company_id.to_string(),
            invoice_id: invoice.id.clone(),
            supplier_id: invoice.supplier_id.clone(),
            amount: new.amount,
            reference: new.reference.trim().to_string(),
            paid_at: new.paid_at.unwrap_or(now),
            created_at: now,
        };
        tx.execute(
            Statement::new(format!(
                "INSERT INTO payments ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                PAYMENT_COLUMNS
            ))
            .bind(&payment.id)
            .bind(company_id)
            .bind(&payment.invoice_id)
            .bind(&payment.supplier_id)
            .bind(payment.amount)
            .bind(&payment.reference)
            .bind(timestamp(payment.paid_at))
            .bind(timestamp(payment.created_at)),
        )
        .await?;

        let settled = outstanding - new.amount <= AMOUNT_TOLERANCE;
        if settled {
            tx.execute(
                Statement::new("UPDATE invoices SET status = ? WHERE company_id = ? AND id = ?")
                    .bind(InvoiceStatus::Pagada.as_str())
                    .bind(company_id)
                    .bind(&invoice.id),
            )
            .await?;
        }

        notify_in(
            &mut tx,
            company_id,
            &supplier_recipient(&invoice.supplier_id),
            "payment_recorded",
            "Pago registrado",
            Some(format!(
                "Pago de {:.2} aplicado al CFDI {} (referencia {})",
                payment.amount, invoice.uuid, payment.reference
            )),
        )
        .await?;
        tx.commit().await?;

        info!(
            company_id,
            invoice_id = %invoice.id,
            payment_id = %payment.id,
            amount = payment.amount,
            settled,
            "Payment recorded"
        );

        Ok(payment)
    }

    pub async fn get_payment(&self, company_id: &str, id: &str) -> PortalResult<Payment> {
        self.require_tenant(company_id)?;
        let rows = self
            .store
            .fetch(
                Statement::new(format!(
                    "SELECT {} FROM payments WHERE company_id = ? AND id = ?",
                    PAYMENT_COLUMNS
                ))
                .bind(company_id)
                .bind(id),
            )
            .await?;
        decode_one(rows, "payment", id)
    }

    pub async fn list_payments(
        &self,
        company_id: &str,
        filter: PaymentFilter,
    ) -> PortalResult<Vec<Payment>> {
        self.require_tenant(company_id)?;
        let stmt = Statement::new(format!(
            "SELECT {} FROM payments WHERE company_id = ?",
            PAYMENT_COLUMNS
        ))
        .bind(company_id)
        .push_opt(" AND supplier_id = ?", filter.supplier_id)
        .push_opt(" AND invoice_id = ?", filter.invoice_id)
        .push(" ORDER BY paid_at DESC");
        decode_all(self.store.fetch(stmt).await?)
    }
}

fn not_payable(id: &str, status: InvoiceStatus) -> PortalError {
    PortalError::invalid_input(format!(
        "Invoice {} is {} and cannot receive payments",
        id, status
    ))
}
