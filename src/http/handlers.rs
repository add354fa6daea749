//! Route handlers. Each one extracts the company, delegates to
//! `PortalServices` and returns JSON; errors render through `PortalError`.

use super::AppState;
use super::middleware::Company;
use crate::db::{Connector, SqlBackend};
use crate::diagnostics::{DebugEntry, DebugRecord};
use crate::error::PortalResult;
use crate::models::{
    Invoice, InvoiceFilter, Message, MessageFilter, NewInvoice, NewMessage, NewPayment,
    NewSupplier, Notification, Payment, PaymentFilter, PurchaseOrder, PurchaseOrderFilter,
    Remission, StatusChange, Supplier, SupplierFilter, SupplierUpdate, TargetSummary,
};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub pools: usize,
    pub targets: Vec<TargetSummary>,
}

pub async fn health<C>(State(state): State<AppState<C>>) -> Json<HealthResponse>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    let targets = state.services.registry().targets().await;
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        pools: targets.len(),
        targets,
    })
}

// =============================================================================
// Suppliers
// =============================================================================

pub async fn list_suppliers<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Query(filter): Query<SupplierFilter>,
) -> PortalResult<Json<Vec<Supplier>>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.list_suppliers(&company, filter).await?))
}

pub async fn create_supplier<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Json(new): Json<NewSupplier>,
) -> PortalResult<(StatusCode, Json<Supplier>)>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    let supplier = state.services.create_supplier(&company, new).await?;
    Ok((StatusCode::CREATED, Json(supplier)))
}

pub async fn get_supplier<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Path(id): Path<String>,
) -> PortalResult<Json<Supplier>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.get_supplier(&company, &id).await?))
}

pub async fn update_supplier<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Path(id): Path<String>,
    Json(update): Json<SupplierUpdate>,
) -> PortalResult<Json<Supplier>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.update_supplier(&company, &id, update).await?))
}

// =============================================================================
// Purchase orders
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RemissionRequest {
    pub user: String,
}

pub async fn list_purchase_orders<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Query(filter): Query<PurchaseOrderFilter>,
) -> PortalResult<Json<Vec<PurchaseOrder>>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.list_purchase_orders(&company, filter).await?))
}

pub async fn get_purchase_order<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Path(id): Path<i64>,
) -> PortalResult<Json<PurchaseOrder>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.get_purchase_order(&company, id).await?))
}

pub async fn generate_remission<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Path(id): Path<i64>,
    Json(request): Json<RemissionRequest>,
) -> PortalResult<(StatusCode, Json<Remission>)>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    let remission = state
        .services
        .generate_remission(&company, id, &request.user)
        .await?;
    Ok((StatusCode::CREATED, Json(remission)))
}

// =============================================================================
// Invoices
// =============================================================================

pub async fn list_invoices<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Query(filter): Query<InvoiceFilter>,
) -> PortalResult<Json<Vec<Invoice>>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.list_invoices(&company, filter).await?))
}

pub async fn submit_invoice<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Json(new): Json<NewInvoice>,
) -> PortalResult<(StatusCode, Json<Invoice>)>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    let invoice = state.services.submit_invoice(&company, new).await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn get_invoice<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Path(id): Path<String>,
) -> PortalResult<Json<Invoice>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.get_invoice(&company, &id).await?))
}

pub async fn update_invoice_status<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Path(id): Path<String>,
    Json(change): Json<StatusChange>,
) -> PortalResult<Json<Invoice>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(
        state
            .services
            .update_invoice_status(&company, &id, change)
            .await?,
    ))
}

pub async fn revalidate_invoice<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Path(id): Path<String>,
) -> PortalResult<Json<Invoice>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.revalidate_invoice(&company, &id).await?))
}

// =============================================================================
// Payments
// =============================================================================

pub async fn list_payments<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Query(filter): Query<PaymentFilter>,
) -> PortalResult<Json<Vec<Payment>>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.list_payments(&company, filter).await?))
}

pub async fn record_payment<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Json(new): Json<NewPayment>,
) -> PortalResult<(StatusCode, Json<Payment>)>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    let payment = state.services.record_payment(&company, new).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

pub async fn get_payment<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Path(id): Path<String>,
) -> PortalResult<Json<Payment>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.get_payment(&company, &id).await?))
}

// =============================================================================
// Messages and notifications
// =============================================================================

pub async fn list_messages<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Query(filter): Query<MessageFilter>,
) -> PortalResult<Json<Vec<Message>>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.list_messages(&company, filter).await?))
}

pub async fn send_message<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Json(new): Json<NewMessage>,
) -> PortalResult<(StatusCode, Json<Message>)>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    let message = state.services.send_message(&company, new).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_message<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Path(id): Path<String>,
) -> PortalResult<Json<Message>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.get_message(&company, &id).await?))
}

pub async fn mark_message_read<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Path(id): Path<String>,
) -> PortalResult<Json<Message>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.mark_message_read(&company, &id).await?))
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    pub recipient: String,
    #[serde(default)]
    pub unread_only: bool,
}

#[derive(Debug, Serialize)]
pub struct MarkedRead {
    pub updated: u64,
}

pub async fn list_notifications<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Query(query): Query<NotificationQuery>,
) -> PortalResult<Json<Vec<Notification>>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(
        state
            .services
            .list_notifications(&company, &query.recipient, query.unread_only)
            .await?,
    ))
}

pub async fn mark_notification_read<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Path(id): Path<String>,
) -> PortalResult<Json<Notification>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    Ok(Json(state.services.mark_notification_read(&company, &id).await?))
}

pub async fn mark_all_read<C>(
    State(state): State<AppState<C>>,
    Company(company): Company,
    Query(query): Query<NotificationQuery>,
) -> PortalResult<Json<MarkedRead>>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    let updated = state
        .services
        .mark_all_read(&company, &query.recipient)
        .await?;
    Ok(Json(MarkedRead { updated }))
}

// =============================================================================
// Diagnostics
// =============================================================================

const DEFAULT_DEBUG_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct DebugQuery {
    pub limit: Option<usize>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DebugResponse {
    pub capacity: usize,
    pub latest: DebugRecord,
    pub entries: Vec<DebugEntry>,
}

pub async fn debug_procedures<C>(
    State(state): State<AppState<C>>,
    Query(query): Query<DebugQuery>,
) -> Json<DebugResponse>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    let log = state.services.invoker().debug_log();
    let limit = query.limit.unwrap_or(DEFAULT_DEBUG_LIMIT);
    Json(DebugResponse {
        capacity: log.capacity(),
        latest: log.latest(),
        entries: log.recent(limit, query.correlation_id.as_deref()),
    })
}
