use super::{PortalServices, decode, decode_all, decode_one, new_id, require_text, timestamp};
use crate::db::{Connector, SqlBackend};
use crate::error::{PortalError, PortalResult};
use crate::models::{ErpSupplier, NewSupplier, Statement, Supplier, SupplierFilter, SupplierUpdate};
use crate::sat::is_valid_rfc;
use chrono::Utc;
use tracing::info;

const SUPPLIER_COLUMNS: &str =
    "id, company_id, erp_code, rfc, name, email, active, created_at, updated_at";

impl<C> PortalServices<C>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    /// Register a portal supplier for an existing ERP supplier code.
    pub async fn create_supplier(
        &self,
        company_id: &str,
        new: NewSupplier,
    ) -> PortalResult<Supplier> {
        self.require_tenant(company_id)?;
        require_text("erp_code", &new.erp_code)?;
        require_text("name", &new.name)?;
        let rfc = new.rfc.trim().to_uppercase();
        if !is_valid_rfc(&rfc) {
            return Err(PortalError::invalid_input(format!("Invalid RFC: {:?}", new.rfc)));
        }

        let erp_code = new.erp_code.trim().to_string();
        if self.get_erp_supplier(company_id, &erp_code).await?.is_none() {
            return Err(PortalError::not_found("ERP supplier", erp_code));
        }

        let id = new_id();
        let now = timestamp(Utc::now());
        self.store
            .execute(
                Statement::new(
                    "INSERT INTO suppliers (id, company_id, erp_code, rfc, name, email, active, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&id)
                .bind(company_id)
                .bind(&erp_code)
                .bind(&rfc)
                .bind(new.name.trim())
                .bind(new.email.clone())
                .bind(true)
                .bind(&now)
                .bind(&now),
            )
            .await?;

        info!(company_id, supplier_id = %id, erp_code = %erp_code, "Supplier registered");
        self.get_supplier(company_id, &id).await
    }

    pub async fn get_supplier(&self, company_id: &str, id: &str) -> PortalResult<Supplier> {
        self.require_tenant(company_id)?;
        let rows = self
            .store
            .fetch(
                Statement::new(format!(
                    "SELECT {} FROM suppliers WHERE company_id = ? AND id = ?",
                    SUPPLIER_COLUMNS
                ))
                .bind(company_id)
                .bind(id),
            )
            .await?;
        decode_one(rows, "supplier", id)
    }

    /// Change name, email or active flag. Fields left as `None` keep their value.
    pub async fn update_supplier(
        &self,
        company_id: &str,
        id: &str,
        update: SupplierUpdate,
    ) -> PortalResult<Supplier> {
        self.get_supplier(company_id, id).await?;
        if let Some(name) = &update.name {
            require_text("name", name)?;
        }

        let stmt = Statement::new("UPDATE suppliers SET updated_at = ?")
            .bind(timestamp(Utc::now()))
            .push_opt(", name = ?", update.name.map(|n| n.trim().to_string()))
            .push_opt(", email = ?", update.email)
            .push_opt(", active = ?", update.active)
            .push(" WHERE company_id = ? AND id = ?")
            .bind(company_id)
            .bind(id);
        self.store.execute(stmt).await?;

        self.get_supplier(company_id, id).await
    }

    pub async fn list_suppliers(
        &self,
        company_id: &str,
        filter: SupplierFilter,
    ) -> PortalResult<Vec<Supplier>> {
        self.require_tenant(company_id)?;
        let mut stmt = Statement::new(format!(
            "SELECT {} FROM suppliers WHERE company_id = ?",
            SUPPLIER_COLUMNS
        ))
        .bind(company_id)
        .push_opt(" AND active = ?", filter.active);

        if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let pattern = format!("%{}%", search);
            stmt = stmt
                .push(" AND (name LIKE ? OR rfc LIKE ? OR erp_code LIKE ?)")
                .bind(&pattern)
                .bind(&pattern)
                .bind(&pattern);
        }

        decode_all(self.store.fetch(stmt.push(" ORDER BY name")).await?)
    }

    /// Supplier as recorded in the tenant's ERP `Prov` table.
    pub async fn get_erp_supplier(
        &self,
        company_id: &str,
        code: &str,
    ) -> PortalResult<Option<ErpSupplier>> {
        let rows = self
            .erp_fetch(company_id, |ctx| {
                Statement::new("SELECT Proveedor, Nombre, RFC, Estatus FROM Prov WHERE Proveedor = ?")
                    .bind(code)
                    .and_filter(ctx.filter())
            })
            .await?;
        rows.into_iter().next().map(decode).transpose()
    }
}
