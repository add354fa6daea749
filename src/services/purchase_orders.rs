use super::{PortalServices, decode_all, decode_one, new_id, require_text, timestamp};
use crate::db::{Connector, SqlBackend};
use crate::error::PortalResult;
use crate::models::{
    ProcedureCall, PurchaseOrder, PurchaseOrderFilter, Record, Remission, SqlType, Statement,
};
use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::info;

/// ERP routine that turns a concluded purchase order into a goods receipt.
pub const REMISSION_PROCEDURE: &str = "spGeneraRemisionCompra";

const ORDER_COLUMNS: &str =
    "ID, Mov, MovID, Proveedor, FechaEmision, Estatus, Importe, Impuestos, Moneda";

impl<C> PortalServices<C>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    pub async fn list_purchase_orders(
        &self,
        company_id: &str,
        filter: PurchaseOrderFilter,
    ) -> PortalResult<Vec<PurchaseOrder>> {
        let rows = self
            .erp_fetch(company_id, |ctx| {
                Statement::new(format!("SELECT {} FROM Compra WHERE 1 = 1", ORDER_COLUMNS))
                    .push_opt(" AND Proveedor = ?", filter.supplier_code.as_deref())
                    .push_opt(" AND Estatus = ?", filter.status.as_deref())
                    .and_filter(ctx.filter())
                    .push(" ORDER BY ID DESC")
            })
            .await?;
        decode_all(rows)
    }

    pub async fn get_purchase_order(
        &self,
        company_id: &str,
        id: i64,
    ) -> PortalResult<PurchaseOrder> {
        let rows = self
            .erp_fetch(company_id, |ctx| {
                Statement::new(format!("SELECT {} FROM Compra WHERE ID = ?", ORDER_COLUMNS))
                    .bind(id)
                    .and_filter(ctx.filter())
            })
            .await?;
        decode_one(rows, "purchase order", &id.to_string())
    }

    /// Generate the ERP remission for a purchase order and record it in the portal.
    ///
    /// The ERP decides whether the order can be received; its rejection is
    /// returned unchanged. The procedure call is never retried.
    pub async fn generate_remission(
        &self,
        company_id: &str,
        order_id: i64,
        user: &str,
    ) -> PortalResult<Remission> {
        require_text("user", user)?;
        let ctx = self.require_tenant(company_id)?;
        // Confirms the order belongs to this tenant before calling the ERP
        self.get_purchase_order(company_id, order_id).await?;

        let call = ProcedureCall::new(REMISSION_PROCEDURE)
            .param("ID", SqlType::Int, order_id)
            .param("Usuario", SqlType::Text, user);
        let rows = self.invoker.invoke(ctx.target(), &call).await?;

        let generated = rows.first();
        let erp_id = generated.and_then(|row| int_column(row, "ID"));
        let folio = generated.and_then(|row| text_column(row, "MovID"));

        let remission = Remission {
            id: new_id(),
            company_id: company_id.to_string(),
            purchase_order_id: order_id,
            erp_id,
            folio,
            generated_by: user.to_string(),
            created_at: Utc::now(),
        };

        let erp_id_sql = if remission.erp_id.is_some() { "?" } else { "NULL" };
        let stmt = Statement::new(format!(
            "INSERT INTO remissions (id, company_id, purchase_order_id, erp_id, folio, generated_by, created_at) \
             VALUES (?, ?, ?, {}, ?, ?, ?)",
            erp_id_sql
        ))
        .bind(&remission.id)
        .bind(company_id)
        .bind(order_id);
        let stmt = match remission.erp_id {
            Some(v) => stmt.bind(v),
            None => stmt,
        };
        self.store
            .execute(
                stmt.bind(remission.folio.clone())
                    .bind(user)
                    .bind(timestamp(remission.created_at)),
            )
            .await?;

        info!(
            company_id,
            purchase_order_id = order_id,
            remission_id = %remission.id,
            folio = remission.folio.as_deref().unwrap_or(""),
            "Remission generated"
        );
        Ok(remission)
    }
}

/// Integer column that drivers may report as a number or as text.
fn int_column(row: &Record, name: &str) -> Option<i64> {
    match row.get(name)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_column(row: &Record, name: &str) -> Option<String> {
    match row.get(name)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
