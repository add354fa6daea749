//! Stored-procedure invoker tests.
//!
//! Routines are served by scripted handlers, so these tests check catalog
//! binding, signature caching and diagnostics without a live ERP server.

mod common;

use common::{FakeConnector, Handler, Scripts, handler, param, procedure, row};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use supplier_portal::ProcedureInvoker;
use supplier_portal::db::{ConnectionRegistry, CredentialVault, RegistryConfig, SignatureCache};
use supplier_portal::diagnostics::{CallOutcome, DebugLog, with_correlation_id};
use supplier_portal::error::{ExecutionClass, PortalError};
use supplier_portal::models::{
    ConnectionTarget, ParamMode, ProcedureCall, SqlType, SqlValue,
};
use tempfile::TempDir;

struct Setup {
    _dir: TempDir,
    target: ConnectionTarget,
    scripts: Scripts,
    invoker: ProcedureInvoker<FakeConnector>,
    log: Arc<DebugLog>,
}

fn setup() -> Setup {
    setup_with_timeout(Duration::from_secs(5))
}

fn setup_with_timeout(query_timeout: Duration) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let target = ConnectionTarget::sqlite(dir.path().join("erp.db").to_str().unwrap());
    let scripts = Scripts::default();
    let registry = ConnectionRegistry::new(
        FakeConnector::new(scripts.clone()),
        CredentialVault::new("TEST_INVOKER_"),
        RegistryConfig::default(),
    );
    let log = Arc::new(DebugLog::new(8));
    let invoker = ProcedureInvoker::new(
        registry,
        Arc::new(SignatureCache::new(Duration::from_secs(300))),
        Arc::clone(&log),
        query_timeout,
    );
    Setup {
        _dir: dir,
        target,
        scripts,
        invoker,
        log,
    }
}

/// Echoes the bound arguments back as one row, in call order.
fn echo() -> Handler {
    handler(|args| {
        let mut record = serde_json::Map::new();
        for (i, arg) in args.iter().enumerate() {
            let value = match &arg.value {
                SqlValue::Null => serde_json::Value::Null,
                SqlValue::Int(v) => json!(v),
                SqlValue::Text(v) => json!(v),
                other => json!(format!("{:?}", other)),
            };
            record.insert(format!("{}:{}", i, arg.name), value);
        }
        Ok(vec![vec![record]])
    })
}

fn lookup_signature() -> supplier_portal::models::ProcedureSignature {
    procedure(
        "spProveedorConsulta",
        vec![
            param("@Empresa", 1, SqlType::Char, ParamMode::In),
            param("@Proveedor", 2, SqlType::Char, ParamMode::In),
            param("@Password", 3, SqlType::Char, ParamMode::In),
        ],
    )
}

fn lookup_call(supplier: &str) -> ProcedureCall {
    ProcedureCall::new("spProveedorConsulta")
        .param("Password", SqlType::Text, "hunter2")
        .param("proveedor", SqlType::Text, supplier)
        .param("@EMPRESA", SqlType::Text, "ACME")
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn edge_case_strings() -> Vec<String> {
    vec![
        String::new(),
        "'".to_string(),
        "'; DROP TABLE Prov; --".to_string(),
        "1 OR 1=1".to_string(),
        "Robert'); DELETE FROM Compra WHERE ('1'='1".to_string(),
        "\\".to_string(),
        "\0".to_string(),
        "ñandú ÁÉÍÓÚ".to_string(),
        "日本語テキスト".to_string(),
        "😀🎉".to_string(),
        "a".repeat(5000),
    ]
}

#[tokio::test]
async fn test_arguments_bound_in_catalog_order() {
    let s = setup();
    s.scripts.register(lookup_signature(), echo());

    let rows = s.invoker.invoke(&s.target, &lookup_call("P001")).await.unwrap();

    assert_eq!(rows.len(), 1);
    let keys: Vec<&String> = rows[0].keys().collect();
    assert_eq!(keys, ["0:@Empresa", "1:@Proveedor", "2:@Password"]);
    assert_eq!(rows[0]["1:@Proveedor"], json!("P001"));
}

#[tokio::test]
async fn test_mismatch_never_reaches_the_database() {
    let s = setup();
    s.scripts.register(lookup_signature(), echo());

    let missing = ProcedureCall::new("spProveedorConsulta").param("Empresa", SqlType::Text, "ACME");
    let unknown = lookup_call("P001").param("Almacen", SqlType::Int, 3);

    for call in [missing, unknown] {
        let err = s.invoker.invoke(&s.target, &call).await.unwrap_err();
        assert!(matches!(err, PortalError::ParameterMismatch { .. }), "{:?}", err);
    }
    assert!(s.scripts.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_procedure() {
    let s = setup();
    let err = s
        .invoker
        .invoke(&s.target, &ProcedureCall::new("spNoExiste"))
        .await
        .unwrap_err();
    assert!(matches!(err, PortalError::ProcedureNotFound { .. }));
    assert!(s.scripts.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_procedure_names_rejected() {
    let s = setup();
    for name in ["sp; DROP TABLE Prov", "dbo.sp.extra", "sp Genera", "", "sp'--"] {
        let err = s
            .invoker
            .invoke(&s.target, &ProcedureCall::new(name))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::InvalidInput { .. }), "{:?}: {:?}", name, err);
    }
    assert_eq!(s.scripts.describe_count(), 0);
}

#[tokio::test]
async fn test_hostile_values_are_bound_verbatim() {
    let s = setup();
    s.scripts.register(lookup_signature(), echo());

    let mut inputs = edge_case_strings();
    inputs.extend((0..20).map(|i| random_string(i * 7 + 1)));

    for input in &inputs {
        let rows = s.invoker.invoke(&s.target, &lookup_call(input)).await.unwrap();
        assert_eq!(rows[0]["1:@Proveedor"], json!(input));
    }
    assert_eq!(s.scripts.calls().len(), inputs.len());
}

#[tokio::test]
async fn test_signature_is_cached() {
    let s = setup();
    s.scripts.register(lookup_signature(), echo());

    for _ in 0..3 {
        s.invoker.invoke(&s.target, &lookup_call("P001")).await.unwrap();
    }
    assert_eq!(s.scripts.describe_count(), 1);
}

#[tokio::test]
async fn test_stale_signature_refreshed_once() {
    let s = setup();
    s.scripts.register(lookup_signature(), echo());
    s.invoker.invoke(&s.target, &lookup_call("P001")).await.unwrap();

    // The routine gained a parameter after the signature was cached
    let mut altered = lookup_signature();
    altered
        .parameters
        .push(param("@Sucursal", 4, SqlType::Int, ParamMode::In));
    s.scripts.register(altered, echo());

    let call = lookup_call("P001").param("Sucursal", SqlType::Int, 2);
    let rows = s.invoker.invoke(&s.target, &call).await.unwrap();

    assert_eq!(rows[0]["3:@Sucursal"], json!(2));
    assert_eq!(s.scripts.describe_count(), 2);
}

#[tokio::test]
async fn test_forget_target_drops_cached_signatures() {
    let s = setup();
    s.scripts.register(lookup_signature(), echo());
    s.invoker.invoke(&s.target, &lookup_call("P001")).await.unwrap();

    s.invoker.forget_target(&s.target).await;
    s.invoker.invoke(&s.target, &lookup_call("P001")).await.unwrap();

    assert_eq!(s.scripts.describe_count(), 2);
}

#[tokio::test]
async fn test_result_set_selection() {
    let s = setup();
    s.scripts.register(
        procedure("spResumen", Vec::new()),
        handler(|_| {
            Ok(vec![
                vec![row(json!({"Total": 2}))],
                vec![row(json!({"ID": 1})), row(json!({"ID": 2}))],
            ])
        }),
    );

    let second = ProcedureCall::new("spResumen").result_set(1);
    assert_eq!(s.invoker.invoke(&s.target, &second).await.unwrap().len(), 2);

    let all = s
        .invoker
        .invoke_all(&s.target, &ProcedureCall::new("spResumen"))
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let out_of_range = ProcedureCall::new("spResumen").result_set(5);
    assert!(matches!(
        s.invoker.invoke(&s.target, &out_of_range).await,
        Err(PortalError::InvalidInput { .. })
    ));

    // The unmet selection is what the debug log keeps, not a success
    let latest = s.log.latest();
    assert!(latest.last_error.unwrap().contains("Result set 5"));
    let newest = &s.log.recent(1, None)[0];
    assert!(matches!(
        &newest.outcome,
        CallOutcome::Failure { error_kind, .. } if error_kind == "invalid_input"
    ));
}

#[tokio::test]
async fn test_stalled_catalog_lookup_times_out() {
    let s = setup_with_timeout(Duration::from_millis(200));
    s.scripts.register(lookup_signature(), echo());
    s.scripts.stall_describes(Duration::from_secs(30));

    let started = std::time::Instant::now();
    let err = s
        .invoker
        .invoke(&s.target, &lookup_call("P001"))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(err.is_connection());
    assert!(err.is_retryable());
    assert!(err.to_string().contains("catalog lookup"));
    assert!(s.scripts.calls().is_empty());
}

#[tokio::test]
async fn test_execution_error_keeps_code_and_procedure() {
    let s = setup();
    s.scripts.register(
        procedure("spFalla", Vec::new()),
        handler(|_| {
            Err(PortalError::execution(
                Some("50000".into()),
                "Movimiento no concluido",
                ExecutionClass::Rejected,
            ))
        }),
    );

    let err = s
        .invoker
        .invoke(&s.target, &ProcedureCall::new("spFalla"))
        .await
        .unwrap_err();
    match err {
        PortalError::Execution {
            procedure,
            code,
            class,
            ..
        } => {
            assert_eq!(procedure.as_deref(), Some("spFalla"));
            assert_eq!(code.as_deref(), Some("50000"));
            assert_eq!(class, ExecutionClass::Rejected);
        }
        other => panic!("expected execution error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_debug_log_redacts_and_tags_requests() {
    let s = setup();
    s.scripts.register(lookup_signature(), echo());

    with_correlation_id(
        "req-1".to_string(),
        s.invoker.invoke(&s.target, &lookup_call("P001")),
    )
    .await
    .unwrap();
    let secret_call = ProcedureCall::new("spProveedorConsulta")
        .param("Empresa", SqlType::Text, "ACME")
        .sensitive_param("Proveedor", SqlType::Text, "P-SECRETO")
        .param("Password", SqlType::Text, "hunter2");
    with_correlation_id(
        "req-2".to_string(),
        s.invoker.invoke(&s.target, &secret_call),
    )
    .await
    .unwrap();

    let entries = s.log.recent(10, None);
    assert_eq!(entries.len(), 2);
    let serialized = serde_json::to_string(&entries).unwrap();
    assert!(!serialized.contains("hunter2"));
    let calls: Vec<_> = entries.iter().map(|e| &e.call).collect();
    assert!(!serde_json::to_string(&calls).unwrap().contains("P-SECRETO"));

    let first = s.log.recent(10, Some("req-1"));
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].call.procedure, "spProveedorConsulta");
    assert!(matches!(first[0].outcome, CallOutcome::Success { rows: 1, .. }));

    let latest = s.log.latest();
    assert!(latest.last_error.is_none());
    assert!(latest.last_call.is_some());
}

#[tokio::test]
async fn test_debug_log_records_failures() {
    let s = setup();
    let _ = s
        .invoker
        .invoke(&s.target, &ProcedureCall::new("spNoExiste"))
        .await;

    let latest = s.log.latest();
    assert!(latest.last_result.is_none());
    assert!(latest.last_error.unwrap().contains("spNoExiste"));
}
