//! Supplier Portal Gateway - Main entry point.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use supplier_portal::auth::OperatorTokens;
use supplier_portal::config::{Config, DEFAULT_REAPER_INTERVAL_SECS, ERP_CREDENTIAL, PORTAL_CREDENTIAL};
use supplier_portal::db::{
    ConnectionRegistry, CredentialVault, RegistryConfig, SignatureCache, SqlxConnector,
};
use supplier_portal::diagnostics::DebugLog;
use supplier_portal::http::{self, RouterOptions};
use supplier_portal::jobs::RevalidationScheduler;
use supplier_portal::models::ConnectionTarget;
use supplier_portal::sat::SatClient;
use supplier_portal::{PortalServices, ProcedureInvoker, TenantDirectory, TenantResolver};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().with_target(true)).init();
    }
}

/// Re-read the tenants file on SIGHUP. A file that fails to parse leaves the
/// current directory in place.
#[cfg(unix)]
fn spawn_tenant_reload(
    services: PortalServices<SqlxConnector>,
    path: PathBuf,
    default_target: ConnectionTarget,
) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "SIGHUP handler unavailable, tenants file will not be reloaded");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match TenantDirectory::load(&path, &default_target) {
                Ok(directory) => {
                    let released = services.reload_tenants(directory).await;
                    info!(path = %path.display(), released, "Tenants file reloaded");
                }
                Err(e) => error!(error = %e, "Tenants file reload failed"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    config.pool_options().validate()?;
    let operator_tokens = OperatorTokens::from_tokens(config.auth_tokens.clone())?;

    info!(
        erp = %config.erp_target().summary(),
        portal = %config.portal_target().summary(),
        "Starting supplier portal gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Passwords go straight into the vault; targets only carry references
    let vault = CredentialVault::new(&config.secret_env_prefix)
        .with_secret(ERP_CREDENTIAL, config.erp_password.clone())
        .with_secret(PORTAL_CREDENTIAL, config.portal_password.clone());

    let registry = ConnectionRegistry::new(
        SqlxConnector::new(config.pool_options()),
        vault,
        RegistryConfig {
            connect_timeout: config.connect_timeout_duration(),
            idle_timeout: config.idle_timeout_duration(),
        },
    );
    registry.start_idle_reaper(std::time::Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS));

    let directory = match &config.tenants_file {
        Some(path) => TenantDirectory::load(path, &config.erp_target())?,
        None => TenantDirectory::single(&config.default_company, config.erp_target()),
    };
    info!(
        tenants = directory.len(),
        active = directory.active_company_ids().len(),
        "Tenant directory loaded"
    );
    let resolver = Arc::new(TenantResolver::new(directory));

    let invoker = ProcedureInvoker::new(
        registry.clone(),
        Arc::new(SignatureCache::new(config.signature_ttl_duration())),
        Arc::new(DebugLog::new(config.debug_capacity)),
        config.query_timeout_duration(),
    );
    let sat = SatClient::new(config.sat_endpoint.clone(), config.sat_timeout_duration())?;

    let services = PortalServices::new(
        registry.clone(),
        resolver,
        invoker,
        sat,
        config.portal_target(),
        config.query_timeout_duration(),
    );
    services.migrate().await?;

    #[cfg(unix)]
    if let Some(path) = config.tenants_file.clone() {
        spawn_tenant_reload(services.clone(), path, config.erp_target());
    }

    if config.enable_scheduler {
        RevalidationScheduler::new(services.clone(), config.scheduler_interval_duration()).spawn();
    }

    if config.enable_debug_endpoint {
        info!(
            guarded = operator_tokens.is_enabled(),
            "Procedure debug endpoint enabled at /debug/procedures"
        );
    }

    let app = http::router(
        services,
        RouterOptions {
            enable_debug_endpoint: config.enable_debug_endpoint,
            operator_tokens: Arc::new(operator_tokens),
        },
    );

    if let Err(e) = http::serve(app, &config.http_bind_addr(), registry).await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
