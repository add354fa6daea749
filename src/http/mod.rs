//! HTTP surface of the gateway.
//!
//! `/api/*` routes take the tenant from the `x-company-id` header. The
//! procedure inspection endpoint is only mounted when enabled, and is guarded
//! by operator bearer tokens when any are configured.

pub mod handlers;
pub mod middleware;
mod server;

pub use middleware::{COMPANY_HEADER, Company, REQUEST_ID_HEADER};
pub use server::serve;

use crate::auth::{OperatorTokens, require_operator};
use crate::db::{Connector, SqlBackend};
use crate::services::PortalServices;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

/// Shared state handed to every handler.
pub struct AppState<C: Connector> {
    pub services: PortalServices<C>,
}

impl<C: Connector> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            services: self.services.clone(),
        }
    }
}

/// What the router exposes beyond the API.
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    pub enable_debug_endpoint: bool,
    pub operator_tokens: Arc<OperatorTokens>,
}

pub fn router<C>(services: PortalServices<C>, options: RouterOptions) -> Router
where
    C: Connector,
    C::Pool: SqlBackend,
{
    use handlers::*;

    let api = Router::new()
        .route(
            "/suppliers",
            get(list_suppliers::<C>).post(create_supplier::<C>),
        )
        .route(
            "/suppliers/{id}",
            get(get_supplier::<C>).patch(update_supplier::<C>),
        )
        .route("/purchase-orders", get(list_purchase_orders::<C>))
        .route("/purchase-orders/{id}", get(get_purchase_order::<C>))
        .route(
            "/purchase-orders/{id}/remission",
            post(generate_remission::<C>),
        )
        .route("/invoices", get(list_invoices::<C>).post(submit_invoice::<C>))
        .route("/invoices/{id}", get(get_invoice::<C>))
        .route(
            "/invoices/{id}/status",
            axum::routing::patch(update_invoice_status::<C>),
        )
        .route("/invoices/{id}/validate", post(revalidate_invoice::<C>))
        .route("/payments", get(list_payments::<C>).post(record_payment::<C>))
        .route("/payments/{id}", get(get_payment::<C>))
        .route("/messages", get(list_messages::<C>).post(send_message::<C>))
        .route("/messages/{id}", get(get_message::<C>))
        .route("/messages/{id}/read", post(mark_message_read::<C>))
        .route("/notifications", get(list_notifications::<C>))
        .route("/notifications/read-all", post(mark_all_read::<C>))
        .route(
            "/notifications/{id}/read",
            post(mark_notification_read::<C>),
        );

    let mut app = Router::new()
        .route("/health", get(health::<C>))
        .nest("/api", api);

    if options.enable_debug_endpoint {
        let debug = Router::new()
            .route("/debug/procedures", get(debug_procedures::<C>))
            .route_layer(axum::middleware::from_fn_with_state(
                Arc::clone(&options.operator_tokens),
                require_operator,
            ));
        app = app.merge(debug);
    }

    app.layer(axum::middleware::from_fn(middleware::request_id))
        .with_state(AppState { services })
}
