//! Invoice submission, SAT validation and payment tests.
//!
//! SAT is a local axum server that answers by CFDI UUID.

mod common;

use common::{
    ACME_RFC, Portal, SUPPLIER_RFC, UUID_CANCELADO, UUID_NO_ENCONTRADO, UUID_SAT_DOWN,
    UUID_VIGENTE, portal_with_sat, start_sat_mock,
};
use std::time::Duration;
use supplier_portal::error::{ExecutionClass, PortalError};
use supplier_portal::jobs::RevalidationScheduler;
use supplier_portal::models::{
    ADMIN_RECIPIENT, Invoice, InvoiceFilter, InvoiceStatus, NewInvoice, NewPayment, NewSupplier,
    PaymentFilter, StatusChange, Statement, SupplierUpdate, supplier_recipient,
};
use tokio_test::assert_ok;

async fn setup() -> (Portal, String) {
    let p = portal_with_sat(start_sat_mock().await).await;
    let supplier = p
        .services
        .create_supplier(
            "ACME",
            NewSupplier {
                erp_code: "P001".into(),
                rfc: SUPPLIER_RFC.into(),
                name: "Papeleria del Norte".into(),
                email: None,
            },
        )
        .await
        .unwrap();
    (p, supplier.id)
}

fn cfdi(supplier_id: &str, uuid: &str, total: f64) -> NewInvoice {
    NewInvoice {
        supplier_id: supplier_id.to_string(),
        purchase_order_id: Some(101),
        uuid: uuid.to_string(),
        issuer_rfc: SUPPLIER_RFC.to_string(),
        receiver_rfc: ACME_RFC.to_string(),
        total,
        currency: None,
    }
}

async fn submit(p: &Portal, supplier_id: &str, uuid: &str, total: f64) -> Invoice {
    p.services
        .submit_invoice("ACME", cfdi(supplier_id, uuid, total))
        .await
        .unwrap()
}

fn payment(invoice_id: &str, amount: f64, reference: &str) -> NewPayment {
    NewPayment {
        invoice_id: invoice_id.to_string(),
        amount,
        reference: reference.to_string(),
        paid_at: None,
    }
}

/// Point an invoice at a different UUID so the SAT mock answers differently.
async fn set_uuid(p: &Portal, invoice_id: &str, uuid: &str) {
    p.services
        .store()
        .execute(
            Statement::new("UPDATE invoices SET uuid = ? WHERE id = ?")
                .bind(uuid.to_uppercase())
                .bind(invoice_id),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_vigente_invoice_is_validated() {
    let (p, supplier_id) = setup().await;

    let invoice = submit(&p, &supplier_id, UUID_VIGENTE, 1160.0).await;

    assert_eq!(invoice.status, InvoiceStatus::Validada);
    assert_eq!(invoice.sat_status.as_deref(), Some("Vigente"));
    assert_eq!(invoice.uuid, UUID_VIGENTE.to_uppercase());
    assert_eq!(invoice.purchase_order_id, Some(101));
    assert_eq!(invoice.currency, "MXN");
}

#[tokio::test]
async fn test_authoritative_rejections_are_persisted() {
    let (p, supplier_id) = setup().await;

    let cancelled = submit(&p, &supplier_id, UUID_CANCELADO, 100.0).await;
    assert_eq!(cancelled.status, InvoiceStatus::Rechazada);
    assert_eq!(cancelled.sat_status.as_deref(), Some("Cancelado"));
    assert!(cancelled.status_reason.is_some());

    let unknown = submit(&p, &supplier_id, UUID_NO_ENCONTRADO, 100.0).await;
    assert_eq!(unknown.status, InvoiceStatus::Rechazada);
    assert_eq!(unknown.sat_status.as_deref(), Some("No Encontrado"));

    let rejections = p
        .services
        .list_notifications("ACME", &supplier_recipient(&supplier_id), false)
        .await
        .unwrap();
    assert_eq!(rejections.len(), 2);
}

#[tokio::test]
async fn test_sat_outage_leaves_invoice_pending() {
    let (p, supplier_id) = setup().await;

    let invoice = submit(&p, &supplier_id, UUID_SAT_DOWN, 100.0).await;

    assert_eq!(invoice.status, InvoiceStatus::Pendiente);
    assert_eq!(invoice.sat_status.as_deref(), Some("Error"));
    assert!(invoice.status_reason.unwrap().contains("500"));
}

#[tokio::test]
async fn test_submission_rules() {
    let (p, supplier_id) = setup().await;
    submit(&p, &supplier_id, UUID_VIGENTE, 1160.0).await;

    // Same folio fiscal, different case
    match p
        .services
        .submit_invoice("ACME", cfdi(&supplier_id, &UUID_VIGENTE.to_lowercase(), 1160.0))
        .await
    {
        Err(PortalError::Execution { class, .. }) => assert_eq!(class, ExecutionClass::Constraint),
        other => panic!("expected a duplicate rejection, got {:?}", other),
    }

    let mut wrong_issuer = cfdi(&supplier_id, UUID_CANCELADO, 10.0);
    wrong_issuer.issuer_rfc = "TOR010101AA1".into();
    assert!(matches!(
        p.services.submit_invoice("ACME", wrong_issuer).await,
        Err(PortalError::InvalidInput { .. })
    ));

    assert!(matches!(
        p.services
            .submit_invoice("ACME", cfdi(&supplier_id, "not-a-uuid", 10.0))
            .await,
        Err(PortalError::InvalidInput { .. })
    ));

    assert!(matches!(
        p.services
            .submit_invoice("ACME", cfdi("missing-supplier", UUID_CANCELADO, 10.0))
            .await,
        Err(PortalError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_inactive_supplier_cannot_submit() {
    let (p, supplier_id) = setup().await;
    p.services
        .update_supplier(
            "ACME",
            &supplier_id,
            SupplierUpdate {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        p.services
            .submit_invoice("ACME", cfdi(&supplier_id, UUID_VIGENTE, 10.0))
            .await,
        Err(PortalError::InvalidInput { .. })
    ));
}

#[tokio::test]
async fn test_admin_status_changes() {
    let (p, supplier_id) = setup().await;
    let invoice = submit(&p, &supplier_id, UUID_VIGENTE, 1160.0).await;

    let approved = p
        .services
        .update_invoice_status(
            "ACME",
            &invoice.id,
            StatusChange {
                status: InvoiceStatus::Aprobada,
                reason: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(approved.status, InvoiceStatus::Aprobada);

    // Payment status is only reached through payments
    assert!(matches!(
        p.services
            .update_invoice_status(
                "ACME",
                &invoice.id,
                StatusChange {
                    status: InvoiceStatus::Pagada,
                    reason: None,
                },
            )
            .await,
        Err(PortalError::InvalidInput { .. })
    ));

    let rejected = p
        .services
        .update_invoice_status(
            "ACME",
            &invoice.id,
            StatusChange {
                status: InvoiceStatus::Rechazada,
                reason: Some("Precio distinto a la orden".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(rejected.status, InvoiceStatus::Rechazada);
    assert_eq!(
        rejected.status_reason.as_deref(),
        Some("Precio distinto a la orden")
    );
}

#[tokio::test]
async fn test_list_invoices_filters() {
    let (p, supplier_id) = setup().await;
    submit(&p, &supplier_id, UUID_VIGENTE, 10.0).await;
    submit(&p, &supplier_id, UUID_CANCELADO, 20.0).await;
    submit(&p, &supplier_id, UUID_SAT_DOWN, 30.0).await;

    let all = p
        .services
        .list_invoices("ACME", InvoiceFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);

    let pending = p
        .services
        .list_invoices(
            "ACME",
            InvoiceFilter {
                status: Some(InvoiceStatus::Pendiente),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].total, 30.0);

    let future = p
        .services
        .list_invoices(
            "ACME",
            InvoiceFilter {
                from: Some(chrono::Utc::now() + chrono::Duration::days(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(future.is_empty());

    assert!(
        p.services
            .list_invoices("GLOBEX", InvoiceFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_revalidation_after_sat_recovers() {
    let (p, supplier_id) = setup().await;
    let stuck = submit(&p, &supplier_id, UUID_SAT_DOWN, 100.0).await;
    let still_down = submit(&p, &supplier_id, "0d5e6fb2-4f81-4e72-9a9d-5e6f708192a3", 50.0).await;
    assert_eq!(stuck.status, InvoiceStatus::Pendiente);

    set_uuid(&p, &stuck.id, UUID_VIGENTE).await;
    let summary = p.services.revalidate_pending("ACME", 10).await.unwrap();

    assert_eq!(summary.checked, 2);
    assert_eq!(summary.validated, 1);
    assert_eq!(summary.still_pending, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(
        p.services.get_invoice("ACME", &stuck.id).await.unwrap().status,
        InvoiceStatus::Validada
    );
    assert_eq!(
        p.services.get_invoice("ACME", &still_down.id).await.unwrap().status,
        InvoiceStatus::Pendiente
    );
}

#[tokio::test]
async fn test_revalidation_detects_cancellation() {
    let (p, supplier_id) = setup().await;
    let invoice = submit(&p, &supplier_id, UUID_VIGENTE, 100.0).await;

    set_uuid(&p, &invoice.id, UUID_CANCELADO).await;
    let revalidated = p
        .services
        .revalidate_invoice("ACME", &invoice.id)
        .await
        .unwrap();
    assert_eq!(revalidated.status, InvoiceStatus::Rechazada);

    // Rejected invoices are final
    assert!(matches!(
        p.services.revalidate_invoice("ACME", &invoice.id).await,
        Err(PortalError::InvalidInput { .. })
    ));
}

#[tokio::test]
async fn test_explicit_revalidation_reports_sat_outage() {
    let (p, supplier_id) = setup().await;
    let invoice = submit(&p, &supplier_id, UUID_SAT_DOWN, 100.0).await;

    match p.services.revalidate_invoice("ACME", &invoice.id).await {
        Err(PortalError::ServiceUnavailable { service, .. }) => assert_eq!(service, "SAT"),
        other => panic!("expected SAT to be unavailable, got {:?}", other),
    }

    // The failed consultation is still on record and the invoice stays pending
    let stored = p.services.get_invoice("ACME", &invoice.id).await.unwrap();
    assert_eq!(stored.status, InvoiceStatus::Pendiente);
    assert_eq!(stored.sat_status.as_deref(), Some("Error"));
}

#[tokio::test]
async fn test_scheduler_sweeps_every_active_tenant() {
    let (p, supplier_id) = setup().await;
    let invoice = submit(&p, &supplier_id, UUID_SAT_DOWN, 100.0).await;
    set_uuid(&p, &invoice.id, UUID_VIGENTE).await;

    let scheduler =
        RevalidationScheduler::new(p.services.clone(), Duration::from_secs(3600)).with_batch_size(5);
    let stats = scheduler.run_once().await;

    assert_eq!(stats.companies, 2);
    assert_eq!(stats.totals.validated, 1);
    assert_eq!(stats.errors_encountered, 0);
}

#[tokio::test]
async fn test_partial_then_full_payment() {
    let (p, supplier_id) = setup().await;
    let invoice = submit(&p, &supplier_id, UUID_VIGENTE, 1160.0).await;

    let first = assert_ok!(
        p.services
            .record_payment("ACME", payment(&invoice.id, 600.0, "SPEI-001"))
            .await
    );
    assert_eq!(first.supplier_id, supplier_id);
    assert_eq!(
        p.services.get_invoice("ACME", &invoice.id).await.unwrap().status,
        InvoiceStatus::Validada
    );

    // Exceeds the 560.00 still owed
    assert!(matches!(
        p.services
            .record_payment("ACME", payment(&invoice.id, 600.0, "SPEI-002"))
            .await,
        Err(PortalError::InvalidInput { .. })
    ));

    assert_ok!(
        p.services
            .record_payment("ACME", payment(&invoice.id, 560.0, "SPEI-003"))
            .await
    );
    assert_eq!(
        p.services.get_invoice("ACME", &invoice.id).await.unwrap().status,
        InvoiceStatus::Pagada
    );

    let payments = p
        .services
        .list_payments(
            "ACME",
            PaymentFilter {
                invoice_id: Some(invoice.id.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(payments.len(), 2);
    assert_eq!(
        p.services.get_payment("ACME", &first.id).await.unwrap().reference,
        "SPEI-001"
    );

    // Settled invoices take no further payments
    assert!(matches!(
        p.services
            .record_payment("ACME", payment(&invoice.id, 1.0, "SPEI-004"))
            .await,
        Err(PortalError::InvalidInput { .. })
    ));

    let notices = p
        .services
        .list_notifications("ACME", &supplier_recipient(&supplier_id), true)
        .await
        .unwrap();
    assert_eq!(notices.iter().filter(|n| n.kind == "payment_recorded").count(), 2);
}

#[tokio::test]
async fn test_payment_rules() {
    let (p, supplier_id) = setup().await;
    let pending = submit(&p, &supplier_id, UUID_SAT_DOWN, 100.0).await;
    let valid = submit(&p, &supplier_id, UUID_VIGENTE, 100.0).await;

    for bad in [0.0, -5.0, f64::NAN] {
        assert!(matches!(
            p.services
                .record_payment("ACME", payment(&valid.id, bad, "SPEI"))
                .await,
            Err(PortalError::InvalidInput { .. })
        ));
    }
    assert!(matches!(
        p.services
            .record_payment("ACME", payment(&valid.id, 10.0, "  "))
            .await,
        Err(PortalError::InvalidInput { .. })
    ));
    assert!(matches!(
        p.services
            .record_payment("ACME", payment(&pending.id, 10.0, "SPEI"))
            .await,
        Err(PortalError::InvalidInput { .. })
    ));
    assert!(matches!(
        p.services
            .record_payment("GLOBEX", payment(&valid.id, 10.0, "SPEI"))
            .await,
        Err(PortalError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_sat_rejected_invoice_refuses_payment() {
    let (p, supplier_id) = setup().await;
    let cancelled = submit(&p, &supplier_id, UUID_CANCELADO, 100.0).await;

    match p
        .services
        .record_payment("ACME", payment(&cancelled.id, 10.0, "SPEI"))
        .await
    {
        Err(PortalError::Validation { uuid, status }) => {
            assert_eq!(uuid, UUID_CANCELADO.to_uppercase());
            assert_eq!(status, "Cancelado");
        }
        other => panic!("expected a SAT rejection, got {:?}", other),
    }

    // An admin rejection of a valid CFDI is a plain status error
    let valid = submit(&p, &supplier_id, UUID_VIGENTE, 100.0).await;
    p.services
        .update_invoice_status(
            "ACME",
            &valid.id,
            StatusChange {
                status: InvoiceStatus::Rechazada,
                reason: Some("Precio distinto a la orden".into()),
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        p.services
            .record_payment("ACME", payment(&valid.id, 10.0, "SPEI"))
            .await,
        Err(PortalError::InvalidInput { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_payments_never_overpay() {
    let (p, supplier_id) = setup().await;
    let invoice = submit(&p, &supplier_id, UUID_VIGENTE, 1000.0).await;

    let attempts: Vec<_> = (0..8)
        .map(|i| {
            let services = p.services.clone();
            let new = payment(&invoice.id, 1000.0, &format!("SPEI-{}", i));
            tokio::spawn(async move { services.record_payment("ACME", new).await })
        })
        .collect();

    let mut accepted = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(PortalError::InvalidInput { .. }) => {}
            Err(other) => panic!("unexpected payment failure: {:?}", other),
        }
    }
    assert_eq!(accepted, 1);

    let paid: f64 = p
        .services
        .list_payments(
            "ACME",
            PaymentFilter {
                invoice_id: Some(invoice.id.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .iter()
        .map(|payment| payment.amount)
        .sum();
    assert!(paid <= invoice.total + 0.005);
    assert_eq!(
        p.services.get_invoice("ACME", &invoice.id).await.unwrap().status,
        InvoiceStatus::Pagada
    );
}

#[tokio::test]
async fn test_failed_payment_leaves_no_partial_writes() {
    let (p, supplier_id) = setup().await;
    let invoice = submit(&p, &supplier_id, UUID_VIGENTE, 500.0).await;

    // The notification insert is the last write; make it fail
    p.services
        .store()
        .execute(Statement::new("DROP TABLE notifications"))
        .await
        .unwrap();
    assert!(
        p.services
            .record_payment("ACME", payment(&invoice.id, 500.0, "SPEI-001"))
            .await
            .is_err()
    );

    let payments = p
        .services
        .list_payments(
            "ACME",
            PaymentFilter {
                invoice_id: Some(invoice.id.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(payments.is_empty());
    let stored = p.services.get_invoice("ACME", &invoice.id).await.unwrap();
    assert_eq!(stored.status, InvoiceStatus::Validada);
    assert_eq!(stored.updated_at, invoice.updated_at);
}

#[tokio::test]
async fn test_admin_is_notified_of_submissions() {
    let (p, supplier_id) = setup().await;
    submit(&p, &supplier_id, UUID_VIGENTE, 10.0).await;

    let admin = p
        .services
        .list_notifications("ACME", ADMIN_RECIPIENT, true)
        .await
        .unwrap();
    assert_eq!(admin.len(), 1);
    assert_eq!(admin[0].kind, "invoice_submitted");
}
