//! Shared fixtures for integration tests.
//!
//! `FakeConnector` opens real SQLite pools for raw statements and serves
//! stored procedures from scripts, so the invoker and the domain services can
//! be exercised without a MySQL or PostgreSQL server.

#![allow(dead_code)]

use axum::Router;
use axum::http::StatusCode;
use axum::routing::post;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use supplier_portal::db::{
    ConnectionRegistry, Connector, CredentialVault, DbPool, DbTransaction, RegistryConfig, Secret,
    SignatureCache, SqlBackend, SqlxConnector,
};
use supplier_portal::diagnostics::DebugLog;
use supplier_portal::error::{ConnectionErrorKind, ExecutionClass, PortalError, PortalResult};
use supplier_portal::models::{
    BoundArg, ConnectionTarget, Engine, ParamMode, ProcedureName, ProcedureSignature, Record,
    ResultSet, RoutineKind, SignatureParam, SqlType, SqlValue, Statement,
};
use supplier_portal::sat::SatClient;
use supplier_portal::{PortalServices, ProcedureInvoker, TenantDirectory, TenantResolver};
use tempfile::TempDir;
use url::Url;

// =============================================================================
// Scripted procedures
// =============================================================================

pub type Handler = Arc<dyn Fn(&[BoundArg]) -> PortalResult<Vec<ResultSet>> + Send + Sync>;

pub fn handler(
    f: impl Fn(&[BoundArg]) -> PortalResult<Vec<ResultSet>> + Send + Sync + 'static,
) -> Handler {
    Arc::new(f)
}

#[derive(Clone)]
struct Script {
    signature: ProcedureSignature,
    handler: Handler,
}

/// Procedures known to every `FakeErp` created by one connector.
#[derive(Clone, Default)]
pub struct Scripts {
    procedures: Arc<Mutex<HashMap<String, Script>>>,
    calls: Arc<Mutex<Vec<(String, Vec<BoundArg>)>>>,
    describes: Arc<AtomicUsize>,
    describe_delay: Arc<Mutex<Duration>>,
    query_timeouts: Arc<AtomicUsize>,
}

impl Scripts {
    pub fn register(&self, signature: ProcedureSignature, handler: Handler) {
        let key = signature.name.as_str().to_ascii_lowercase();
        self.procedures
            .lock()
            .unwrap()
            .insert(key, Script { signature, handler });
    }

    pub fn remove(&self, name: &str) {
        self.procedures
            .lock()
            .unwrap()
            .remove(&name.to_ascii_lowercase());
    }

    /// Every executed call, in order.
    pub fn calls(&self) -> Vec<(String, Vec<BoundArg>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn describe_count(&self) -> usize {
        self.describes.load(Ordering::SeqCst)
    }

    /// Number of upcoming queries that report a query timeout.
    pub fn time_out_queries(&self, count: usize) {
        self.query_timeouts.store(count, Ordering::SeqCst);
    }

    /// Make every catalog lookup stall for `delay`.
    pub fn stall_describes(&self, delay: Duration) {
        *self.describe_delay.lock().unwrap() = delay;
    }
}

/// SQLite for raw statements, scripts for routines.
#[derive(Clone)]
pub struct FakeErp {
    pool: DbPool,
    scripts: Scripts,
}

impl std::fmt::Debug for FakeErp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeErp").field("pool", &self.pool).finish_non_exhaustive()
    }
}

impl SqlBackend for FakeErp {
    fn engine(&self) -> Engine {
        Engine::Sqlite
    }

    async fn fetch_all(&self, stmt: &Statement, timeout: Duration) -> PortalResult<Vec<Record>> {
        let timing_out = self
            .scripts
            .query_timeouts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if timing_out {
            return Err(PortalError::timeout("query execution", timeout.as_secs()));
        }
        self.pool.fetch_all(stmt, timeout).await
    }

    async fn execute(&self, stmt: &Statement, timeout: Duration) -> PortalResult<u64> {
        self.pool.execute(stmt, timeout).await
    }

    async fn describe_procedure(
        &self,
        name: &ProcedureName,
    ) -> PortalResult<Option<ProcedureSignature>> {
        self.scripts.describes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.scripts.describe_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let procedures = self.scripts.procedures.lock().unwrap();
        Ok(procedures
            .get(&name.as_str().to_ascii_lowercase())
            .map(|s| s.signature.clone()))
    }

    async fn call_procedure(
        &self,
        signature: &ProcedureSignature,
        args: &[BoundArg],
        _timeout: Duration,
    ) -> PortalResult<Vec<ResultSet>> {
        let handler = {
            let procedures = self.scripts.procedures.lock().unwrap();
            procedures
                .get(&signature.name.as_str().to_ascii_lowercase())
                .map(|s| Arc::clone(&s.handler))
        };
        self.scripts
            .calls
            .lock()
            .unwrap()
            .push((signature.name.as_str().to_string(), args.to_vec()));
        match handler {
            Some(handler) => handler(args),
            None => Err(PortalError::procedure_not_found(signature.name.as_str())),
        }
    }

    type Transaction = DbTransaction;

    async fn begin(&self, timeout: Duration) -> PortalResult<DbTransaction> {
        self.pool.begin(timeout).await
    }
}

pub struct FakeConnector {
    inner: SqlxConnector,
    pub scripts: Scripts,
    pub connects: AtomicUsize,
    /// Number of upcoming handshakes that fail as unreachable
    pub fail_connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(scripts: Scripts) -> Self {
        Self {
            inner: SqlxConnector::default(),
            scripts,
            connects: AtomicUsize::new(0),
            fail_connects: AtomicUsize::new(0),
        }
    }
}

impl Connector for FakeConnector {
    type Pool = FakeErp;

    async fn connect(&self, target: &ConnectionTarget, secret: Secret) -> PortalResult<FakeErp> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PortalError::connection(
                ConnectionErrorKind::Unreachable,
                "connection refused",
                "start the server",
            ));
        }
        let pool = self.inner.connect(target, secret).await?;
        Ok(FakeErp {
            pool,
            scripts: self.scripts.clone(),
        })
    }

    fn is_open(&self, pool: &FakeErp) -> bool {
        !pool.pool.is_closed()
    }

    async fn close(&self, pool: &FakeErp) {
        pool.pool.close().await
    }
}

// =============================================================================
// Signatures
// =============================================================================

pub fn param(name: &str, ordinal: u32, sql_type: SqlType, mode: ParamMode) -> SignatureParam {
    SignatureParam {
        name: name.to_string(),
        ordinal,
        sql_type,
        mode,
    }
}

pub fn procedure(name: &str, parameters: Vec<SignatureParam>) -> ProcedureSignature {
    ProcedureSignature {
        name: ProcedureName::parse(name).unwrap(),
        kind: RoutineKind::Procedure,
        parameters,
    }
}

pub fn remission_signature() -> ProcedureSignature {
    procedure(
        "spGeneraRemisionCompra",
        vec![
            param("@ID", 1, SqlType::Int, ParamMode::In),
            param("@Usuario", 2, SqlType::Char, ParamMode::In),
        ],
    )
}

pub fn row(value: serde_json::Value) -> Record {
    value.as_object().cloned().unwrap()
}

/// Generates a remission for concluded orders and rejects anything else,
/// like a `RAISERROR` in the ERP routine. Statuses mirror the seeded `Compra`.
pub fn remission_handler() -> Handler {
    let statuses: HashMap<i64, &'static str> =
        HashMap::from([(101, "CONCLUIDO"), (102, "PENDIENTE"), (201, "CONCLUIDO")]);
    handler(move |args| {
        let id = match args.first().map(|a| &a.value) {
            Some(SqlValue::Int(id)) => *id,
            other => panic!("unexpected ID argument: {:?}", other),
        };
        match statuses.get(&id).copied() {
            Some("CONCLUIDO") => Ok(vec![vec![row(serde_json::json!({
                "ID": 9000 + id,
                "MovID": format!("REM-{}", id)
            }))]]),
            Some(other) => Err(PortalError::execution(
                Some("50000".into()),
                format!("La orden {} esta {}", id, other),
                ExecutionClass::Rejected,
            )),
            None => Err(PortalError::execution(
                Some("50000".into()),
                format!("La orden {} no existe", id),
                ExecutionClass::Rejected,
            )),
        }
    })
}

// =============================================================================
// SAT mock
// =============================================================================

pub const UUID_VIGENTE: &str = "6f1c2a7e-0b4d-4a3e-9c5f-1a2b3c4d5e6f";
pub const UUID_CANCELADO: &str = "7a2d3b8f-1c5e-4b4f-8d6a-2b3c4d5e6f70";
pub const UUID_NO_ENCONTRADO: &str = "8b3e4c90-2d6f-4c50-9e7b-3c4d5e6f7081";
/// Any other UUID makes the mock answer HTTP 500.
pub const UUID_SAT_DOWN: &str = "9c4f5da1-3e70-4d61-8f8c-4d5e6f708192";

fn sat_body(estado: &str, codigo: &str) -> String {
    format!(
        r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><ConsultaResponse xmlns="http://tempuri.org/"><ConsultaResult xmlns:a="http://schemas.datacontract.org/2004/07/Sat.Cfdi.Negocio.ConsultaCfdi.Servicio"><a:CodigoEstatus>{}</a:CodigoEstatus><a:Estado>{}</a:Estado></ConsultaResult></ConsultaResponse></s:Body></s:Envelope>"#,
        codigo, estado
    )
}

async fn consulta(body: String) -> (StatusCode, String) {
    let ok = "S - Comprobante obtenido satisfactoriamente.";
    if body.contains(&UUID_VIGENTE.to_uppercase()) {
        (StatusCode::OK, sat_body("Vigente", ok))
    } else if body.contains(&UUID_CANCELADO.to_uppercase()) {
        (StatusCode::OK, sat_body("Cancelado", ok))
    } else if body.contains(&UUID_NO_ENCONTRADO.to_uppercase()) {
        (
            StatusCode::OK,
            sat_body("No Encontrado", "N - 602: Comprobante no encontrado."),
        )
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Service Unavailable".into())
    }
}

/// Local SOAP endpoint answering by CFDI UUID.
pub async fn start_sat_mock() -> Url {
    let app = Router::new().route("/ConsultaCFDIService.svc", post(consulta));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{}/ConsultaCFDIService.svc", addr)).unwrap()
}

// =============================================================================
// Portal fixture
// =============================================================================

pub const TENANTS: &str = r#"
    [[tenant]]
    company_id = "ACME"
    name = "Acme SA de CV"
    isolation = { mode = "shared_row", column = "Empresa", value = "ACME" }

    [[tenant]]
    company_id = "GLOBEX"
    isolation = { mode = "shared_row", column = "Empresa", value = "GLOBEX" }

    [[tenant]]
    company_id = "INITECH"
    active = false
"#;

pub const ACME_RFC: &str = "ACM010101AB1";
pub const SUPPLIER_RFC: &str = "PRO010101XY2";

const ERP_SEED: &[&str] = &[
    "CREATE TABLE Prov (Proveedor TEXT NOT NULL, Nombre TEXT NOT NULL, RFC TEXT, Estatus TEXT, Empresa TEXT NOT NULL)",
    "CREATE TABLE Compra (ID INTEGER NOT NULL, Mov TEXT NOT NULL, MovID TEXT, Proveedor TEXT NOT NULL, \
     FechaEmision TEXT, Estatus TEXT NOT NULL, Importe REAL, Impuestos REAL, Moneda TEXT, Empresa TEXT NOT NULL)",
    "INSERT INTO Prov VALUES ('P001', 'Papeleria del Norte', 'PRO010101XY2', 'ALTA', 'ACME')",
    "INSERT INTO Prov VALUES ('P002', 'Tornillos Globex', 'TOR010101AA1', 'ALTA', 'GLOBEX')",
    "INSERT INTO Compra VALUES (101, 'Orden Compra', 'OC-101', 'P001', '2026-01-10', 'CONCLUIDO', 1000.0, 160.0, 'Pesos', 'ACME')",
    "INSERT INTO Compra VALUES (102, 'Orden Compra', 'OC-102', 'P001', '2026-01-12', 'PENDIENTE', 500.0, 80.0, 'Pesos', 'ACME')",
    "INSERT INTO Compra VALUES (201, 'Orden Compra', 'OC-201', 'P002', '2026-01-11', 'CONCLUIDO', 750.0, 120.0, 'Pesos', 'GLOBEX')",
];

pub struct Portal {
    pub dir: TempDir,
    pub services: PortalServices<FakeConnector>,
    pub registry: ConnectionRegistry<FakeConnector>,
    pub erp_target: ConnectionTarget,
    pub scripts: Scripts,
    pub debug_log: Arc<DebugLog>,
}

impl Portal {
    /// Direct access to the ERP database, bypassing the services.
    pub async fn erp(&self) -> DbPool {
        self.registry.acquire(&self.erp_target).await.unwrap().pool
    }

    pub fn connects(&self) -> usize {
        self.registry.connector().connects.load(Ordering::SeqCst)
    }
}

pub async fn portal() -> Portal {
    portal_with_sat(Url::parse("http://127.0.0.1:9/ConsultaCFDIService.svc").unwrap()).await
}

pub async fn portal_with_sat(sat_endpoint: Url) -> Portal {
    let dir = tempfile::tempdir().unwrap();
    let path = |name: &str| dir.path().join(name).to_str().unwrap().to_string();
    let erp_target = ConnectionTarget::sqlite(path("erp.db"));
    let portal_target = ConnectionTarget::sqlite(path("portal.db"));

    let scripts = Scripts::default();
    let registry = ConnectionRegistry::new(
        FakeConnector::new(scripts.clone()),
        CredentialVault::new("TEST_PORTAL_SECRET_"),
        RegistryConfig::default(),
    );

    let erp = registry.acquire(&erp_target).await.unwrap();
    for sql in ERP_SEED {
        erp.execute(&Statement::new(*sql), Duration::from_secs(5))
            .await
            .unwrap();
    }
    scripts.register(remission_signature(), remission_handler());

    let directory = TenantDirectory::from_toml(TENANTS, &erp_target).unwrap();
    let debug_log = Arc::new(DebugLog::new(20));
    let invoker = ProcedureInvoker::new(
        registry.clone(),
        Arc::new(SignatureCache::new(Duration::from_secs(300))),
        Arc::clone(&debug_log),
        Duration::from_secs(5),
    );
    let sat = SatClient::new(sat_endpoint, Duration::from_secs(2)).unwrap();

    let services = PortalServices::new(
        registry.clone(),
        Arc::new(TenantResolver::new(directory)),
        invoker,
        sat,
        portal_target,
        Duration::from_secs(5),
    );
    services.migrate().await.unwrap();

    Portal {
        dir,
        services,
        registry,
        erp_target,
        scripts,
        debug_log,
    }
}
