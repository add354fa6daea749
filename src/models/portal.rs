//! Portal domain records.
//!
//! Rows are decoded from `Record`s through serde, so field names follow the
//! column names of the portal schema (and of the ERP tables for purchase
//! orders).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Accept `true`/`false`, `0`/`1` and their string forms.
///
/// MySQL reports BOOLEAN columns as TINYINT and SQLite stores them as
/// integers, so boolean columns can arrive in any of these shapes.
fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bool(v) => Ok(v),
        Raw::Int(v) => Ok(v != 0),
        Raw::Text(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            other => Err(serde::de::Error::custom(format!("invalid boolean: {}", other))),
        },
    }
}

// =============================================================================
// Suppliers
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supplier {
    pub id: String,
    pub company_id: String,
    /// Supplier code in the ERP `Prov` table
    pub erp_code: String,
    pub rfc: String,
    pub name: String,
    pub email: Option<String>,
    #[serde(deserialize_with = "flexible_bool")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSupplier {
    pub erp_code: String,
    pub rfc: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SupplierUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SupplierFilter {
    pub active: Option<bool>,
    /// Matches name, RFC or ERP code
    pub search: Option<String>,
}

/// Supplier as stored in the ERP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErpSupplier {
    #[serde(rename = "Proveedor")]
    pub code: String,
    #[serde(rename = "Nombre")]
    pub name: String,
    #[serde(rename = "RFC")]
    pub rfc: Option<String>,
    #[serde(rename = "Estatus")]
    pub status: Option<String>,
}

// =============================================================================
// Purchase orders (ERP)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "Mov")]
    pub movement: String,
    #[serde(rename = "MovID")]
    pub folio: Option<String>,
    #[serde(rename = "Proveedor")]
    pub supplier_code: String,
    #[serde(rename = "FechaEmision")]
    pub issued_at: Option<String>,
    #[serde(rename = "Estatus")]
    pub status: String,
    #[serde(rename = "Importe")]
    pub amount: Option<f64>,
    #[serde(rename = "Impuestos")]
    pub taxes: Option<f64>,
    #[serde(rename = "Moneda")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PurchaseOrderFilter {
    pub supplier_code: Option<String>,
    pub status: Option<String>,
}

/// Goods receipt generated in the ERP from a concluded purchase order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remission {
    pub id: String,
    pub company_id: String,
    pub purchase_order_id: i64,
    /// ERP movement id of the generated remission
    pub erp_id: Option<i64>,
    pub folio: Option<String>,
    pub generated_by: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Invoices
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Pendiente,
    Validada,
    Aprobada,
    Rechazada,
    Pagada,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pendiente => "Pendiente",
            Self::Validada => "Validada",
            Self::Aprobada => "Aprobada",
            Self::Rechazada => "Rechazada",
            Self::Pagada => "Pagada",
        }
    }

    /// Whether payments may be recorded against an invoice in this status.
    pub fn is_payable(&self) -> bool {
        matches!(self, Self::Validada | Self::Aprobada)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub company_id: String,
    pub supplier_id: String,
    pub purchase_order_id: Option<i64>,
    /// CFDI folio fiscal
    pub uuid: String,
    pub issuer_rfc: String,
    pub receiver_rfc: String,
    pub total: f64,
    pub currency: String,
    pub status: InvoiceStatus,
    /// Last answer from the SAT service
    pub sat_status: Option<String>,
    pub status_reason: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewInvoice {
    pub supplier_id: String,
    #[serde(default)]
    pub purchase_order_id: Option<i64>,
    pub uuid: String,
    pub issuer_rfc: String,
    pub receiver_rfc: String,
    pub total: f64,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceFilter {
    pub supplier_id: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Admin decision on an invoice.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusChange {
    pub status: InvoiceStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub company_id: String,
    pub invoice_id: String,
    pub supplier_id: String,
    pub amount: f64,
    pub reference: String,
    pub paid_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPayment {
    pub invoice_id: String,
    pub amount: f64,
    pub reference: String,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentFilter {
    pub supplier_id: Option<String>,
    pub invoice_id: Option<String>,
}

// =============================================================================
// Messages and notifications
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    ToSupplier,
    ToAdmin,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToSupplier => "to_supplier",
            Self::ToAdmin => "to_admin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub company_id: String,
    pub supplier_id: String,
    pub direction: MessageDirection,
    pub sender: String,
    pub subject: String,
    pub body: String,
    #[serde(alias = "is_read", deserialize_with = "flexible_bool")]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    pub supplier_id: String,
    pub direction: MessageDirection,
    pub sender: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageFilter {
    pub supplier_id: Option<String>,
    #[serde(default)]
    pub unread_only: bool,
}

/// Notification recipient used for admin users.
pub const ADMIN_RECIPIENT: &str = "admin";

/// Notification recipient key for a supplier.
pub fn supplier_recipient(supplier_id: &str) -> String {
    format!("supplier:{}", supplier_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub company_id: String,
    pub recipient: String,
    pub kind: String,
    pub title: String,
    pub body: Option<String>,
    #[serde(alias = "is_read", deserialize_with = "flexible_bool")]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewNotification {
    pub recipient: String,
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_status_serde_uses_portal_labels() {
        let json = serde_json::to_string(&InvoiceStatus::Rechazada).unwrap();
        assert_eq!(json, "\"Rechazada\"");
        let status: InvoiceStatus = serde_json::from_str("\"Pagada\"").unwrap();
        assert_eq!(status, InvoiceStatus::Pagada);
    }

    #[test]
    fn test_payable_statuses() {
        assert!(InvoiceStatus::Validada.is_payable());
        assert!(InvoiceStatus::Aprobada.is_payable());
        assert!(!InvoiceStatus::Pendiente.is_payable());
        assert!(!InvoiceStatus::Pagada.is_payable());
    }

    #[test]
    fn test_purchase_order_decodes_erp_columns() {
        let order: PurchaseOrder = serde_json::from_value(serde_json::json!({
            "ID": 42,
            "Mov": "Orden Compra",
            "MovID": "OC-1001",
            "Proveedor": "P001",
            "FechaEmision": "2026-01-15 00:00:00",
            "Estatus": "CONCLUIDO",
            "Importe": 1500.0,
            "Impuestos": 240.0,
            "Moneda": "Pesos"
        }))
        .unwrap();
        assert_eq!(order.id, 42);
        assert_eq!(order.status, "CONCLUIDO");
    }

    #[test]
    fn test_boolean_columns_accept_integers() {
        let notification: Notification = serde_json::from_value(serde_json::json!({
            "id": "n1",
            "company_id": "ACME",
            "recipient": "admin",
            "kind": "invoice_submitted",
            "title": "Nueva factura",
            "body": null,
            "is_read": 1,
            "created_at": "2026-01-15T10:00:00.000000Z"
        }))
        .unwrap();
        assert!(notification.read);

        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["read"], serde_json::json!(true));
    }

    #[test]
    fn test_supplier_recipient() {
        assert_eq!(supplier_recipient("abc"), "supplier:abc");
    }
}
