//! Tenant routing models.

use crate::error::{PortalError, PortalResult};
use crate::models::{ConnectionTarget, is_identifier};
use serde::{Deserialize, Serialize};

/// Row-level discriminator appended to queries against a shared ERP database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRowFilter")]
pub struct RowFilter {
    column: String,
    value: String,
}

#[derive(Deserialize)]
struct RawRowFilter {
    column: String,
    value: String,
}

impl TryFrom<RawRowFilter> for RowFilter {
    type Error = PortalError;

    fn try_from(raw: RawRowFilter) -> Result<Self, Self::Error> {
        RowFilter::new(raw.column, raw.value)
    }
}

impl RowFilter {
    /// The column is spliced into SQL text, so it must be a plain identifier.
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> PortalResult<Self> {
        let column = column.into();
        if !is_identifier(&column) {
            return Err(PortalError::invalid_input(format!(
                "Row filter column must be a plain identifier: {:?}",
                column
            )));
        }
        Ok(Self {
            column,
            value: value.into(),
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// How a tenant's ERP data is isolated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantRoute {
    /// The tenant owns the whole database.
    PerDatabase(ConnectionTarget),
    /// The database is shared; every query carries the discriminator.
    SharedWithFilter {
        target: ConnectionTarget,
        filter: RowFilter,
    },
}

/// Resolved routing for one request. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub company_id: String,
    pub route: TenantRoute,
}

impl TenantContext {
    pub fn target(&self) -> &ConnectionTarget {
        match &self.route {
            TenantRoute::PerDatabase(target) => target,
            TenantRoute::SharedWithFilter { target, .. } => target,
        }
    }

    pub fn filter(&self) -> Option<&RowFilter> {
        match &self.route {
            TenantRoute::PerDatabase(_) => None,
            TenantRoute::SharedWithFilter { filter, .. } => Some(filter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_filter_rejects_sql_in_column() {
        assert!(RowFilter::new("Empresa", "ACME").is_ok());
        assert!(RowFilter::new("Empresa = 'x' OR 1", "ACME").is_err());
        assert!(RowFilter::new("", "ACME").is_err());
    }

    #[test]
    fn test_row_filter_deserialize_validates() {
        let ok: Result<RowFilter, _> =
            serde_json::from_str(r#"{"column": "Empresa", "value": "ACME"}"#);
        assert!(ok.is_ok());

        let bad: Result<RowFilter, _> =
            serde_json::from_str(r#"{"column": "Empresa;--", "value": "ACME"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_context_accessors() {
        let target = ConnectionTarget::sqlite("erp.db");
        let ctx = TenantContext {
            company_id: "ACME".into(),
            route: TenantRoute::SharedWithFilter {
                target: target.clone(),
                filter: RowFilter::new("Empresa", "ACME").unwrap(),
            },
        };
        assert_eq!(ctx.target(), &target);
        assert_eq!(ctx.filter().map(|f| f.value()), Some("ACME"));
    }
}
