//! Configuration handling for the supplier portal gateway.
//!
//! This module provides configuration management via CLI arguments and environment variables.
//! Passwords are accepted here only to seed the credential vault; they are
//! never copied into a `ConnectionTarget`.

use crate::models::{ConnectionTarget, CredentialRef, Engine, TlsPolicy};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SAT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_SAT_ENDPOINT: &str =
    "https://consultaqr.facturaelectronica.sat.gob.mx/ConsultaCFDIService.svc";
pub const DEFAULT_SIGNATURE_TTL_SECS: u64 = 300;
pub const DEFAULT_DEBUG_CAPACITY: usize = 50;
pub const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 900;
pub const DEFAULT_SECRET_ENV_PREFIX: &str = "PORTAL_SECRET_";
pub const DEFAULT_COMPANY: &str = "DEFAULT";

/// Credential names under which the configured passwords are registered.
pub const ERP_CREDENTIAL: &str = "erp";
pub const PORTAL_CREDENTIAL: &str = "portal";

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;

/// Connection pool configuration options.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10 for MySQL/PostgreSQL, 1 for SQLite)
    pub max_connections: Option<u32>,
    /// Minimum connections in pool (default: 1)
    pub min_connections: Option<u32>,
    /// Idle timeout in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
    /// Whether to test connections before use (default: true)
    pub test_before_acquire: Option<bool>,
}

impl PoolOptions {
    /// Get max_connections with default value based on database type.
    pub fn max_connections_or_default(&self, is_sqlite: bool) -> u32 {
        self.max_connections.unwrap_or(if is_sqlite {
            DEFAULT_MAX_CONNECTIONS_SQLITE
        } else {
            DEFAULT_MAX_CONNECTIONS
        })
    }

    /// Get min_connections with default value.
    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    /// Get idle_timeout with default value.
    pub fn idle_timeout_or_default(&self) -> u64 {
        self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> u64 {
        self.acquire_timeout_secs
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS)
    }

    /// Get test_before_acquire with default value.
    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            if min == 0 {
                return Err("min_connections must be greater than 0".to_string());
            }
            if let Some(max) = self.max_connections {
                if min > max {
                    return Err(format!(
                        "min_connections ({}) cannot exceed max_connections ({})",
                        min, max
                    ));
                }
            }
        }
        Ok(())
    }
}

fn parse_engine(s: &str) -> Result<Engine, String> {
    s.parse()
}

/// Configuration for the supplier portal gateway.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "supplier-portal",
    about = "Supplier portal data gateway - multi-tenant ERP routing, stored procedures and CFDI validation",
    version,
    author
)]
pub struct Config {
    // ---- ERP database -------------------------------------------------------
    /// ERP engine (mysql, postgres, sqlite)
    #[arg(long, default_value = "mysql", value_parser = parse_engine, env = "ERP_ENGINE")]
    pub erp_engine: Engine,

    #[arg(long, default_value = "localhost", env = "ERP_HOST")]
    pub erp_host: String,

    #[arg(long, env = "ERP_PORT")]
    pub erp_port: Option<u16>,

    #[arg(long, default_value = "", env = "ERP_USER")]
    pub erp_user: String,

    /// ERP password (sensitive - only used to seed the credential vault)
    #[arg(long, env = "ERP_PASSWORD", hide_env_values = true)]
    pub erp_password: Option<String>,

    #[arg(long, default_value = "erp", env = "ERP_DATABASE")]
    pub erp_database: String,

    /// Require an encrypted ERP connection
    #[arg(long, env = "ERP_ENCRYPT")]
    pub erp_encrypt: bool,

    /// Accept the ERP server certificate without chain verification
    #[arg(long, env = "ERP_TRUST_SERVER_CERTIFICATE")]
    pub erp_trust_server_certificate: bool,

    // ---- Portal database ----------------------------------------------------
    /// Portal engine (mysql, postgres, sqlite)
    #[arg(long, default_value = "sqlite", value_parser = parse_engine, env = "PORTAL_DB_ENGINE")]
    pub portal_engine: Engine,

    #[arg(long, default_value = "localhost", env = "PORTAL_DB_HOST")]
    pub portal_host: String,

    #[arg(long, env = "PORTAL_DB_PORT")]
    pub portal_port: Option<u16>,

    #[arg(long, default_value = "", env = "PORTAL_DB_USER")]
    pub portal_user: String,

    /// Portal password (sensitive - only used to seed the credential vault)
    #[arg(long, env = "PORTAL_DB_PASSWORD", hide_env_values = true)]
    pub portal_password: Option<String>,

    /// Database name, or file path for SQLite
    #[arg(long, default_value = "portal.db", env = "PORTAL_DB_DATABASE")]
    pub portal_database: String,

    #[arg(long, env = "PORTAL_DB_ENCRYPT")]
    pub portal_encrypt: bool,

    #[arg(long, env = "PORTAL_DB_TRUST_SERVER_CERTIFICATE")]
    pub portal_trust_server_certificate: bool,

    // ---- Tenancy and secrets ------------------------------------------------
    /// TOML file mapping companies to ERP targets
    #[arg(long, env = "PORTAL_TENANTS_FILE")]
    pub tenants_file: Option<PathBuf>,

    /// Company served by the default ERP target when no tenants file is given
    #[arg(long, default_value = DEFAULT_COMPANY, env = "PORTAL_DEFAULT_COMPANY")]
    pub default_company: String,

    /// Prefix of environment variables holding named secrets
    #[arg(long, default_value = DEFAULT_SECRET_ENV_PREFIX, env = "PORTAL_SECRET_ENV_PREFIX")]
    pub secret_env_prefix: String,

    // ---- Pools and timeouts -------------------------------------------------
    #[arg(long, env = "PORTAL_MAX_CONNECTIONS")]
    pub max_connections: Option<u32>,

    #[arg(long, env = "PORTAL_MIN_CONNECTIONS")]
    pub min_connections: Option<u32>,

    /// Idle timeout of a pooled target in seconds
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS, env = "PORTAL_IDLE_TIMEOUT")]
    pub idle_timeout: u64,

    /// Query timeout in seconds
    #[arg(long, default_value_t = DEFAULT_QUERY_TIMEOUT_SECS, env = "PORTAL_QUERY_TIMEOUT")]
    pub query_timeout: u64,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS, env = "PORTAL_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,

    /// Lifetime of a cached stored-procedure signature in seconds
    #[arg(long, default_value_t = DEFAULT_SIGNATURE_TTL_SECS, env = "PORTAL_SIGNATURE_TTL")]
    pub signature_ttl: u64,

    // ---- SAT ----------------------------------------------------------------
    #[arg(long, default_value = DEFAULT_SAT_ENDPOINT, env = "SAT_ENDPOINT")]
    pub sat_endpoint: Url,

    /// SAT request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_SAT_TIMEOUT_SECS, env = "SAT_TIMEOUT")]
    pub sat_timeout: u64,

    // ---- HTTP and diagnostics -----------------------------------------------
    #[arg(long, default_value = DEFAULT_HTTP_HOST, env = "PORTAL_HTTP_HOST")]
    pub http_host: String,

    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "PORTAL_HTTP_PORT")]
    pub http_port: u16,

    /// Mount the stored-procedure inspection endpoint at /debug/procedures
    #[arg(long, env = "PORTAL_ENABLE_DEBUG_ENDPOINT")]
    pub enable_debug_endpoint: bool,

    /// Number of recent procedure calls kept for inspection
    #[arg(long, default_value_t = DEFAULT_DEBUG_CAPACITY, env = "PORTAL_DEBUG_CAPACITY")]
    pub debug_capacity: usize,

    /// Bearer tokens accepted by the inspection endpoint.
    /// Can be specified multiple times or as comma-separated values.
    #[arg(
        long = "auth-token",
        value_name = "TOKEN",
        env = "PORTAL_AUTH_TOKENS",
        value_delimiter = ',',
        hide_env_values = true
    )]
    pub auth_tokens: Vec<String>,

    // ---- Background jobs ----------------------------------------------------
    /// Run the periodic SAT re-validation job
    #[arg(long, env = "PORTAL_ENABLE_SCHEDULER")]
    pub enable_scheduler: bool,

    #[arg(long, default_value_t = DEFAULT_SCHEDULER_INTERVAL_SECS, env = "PORTAL_SCHEDULER_INTERVAL")]
    pub scheduler_interval: u64,

    // ---- Logging ------------------------------------------------------------
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "PORTAL_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "PORTAL_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            erp_engine: Engine::MySql,
            erp_host: "localhost".to_string(),
            erp_port: None,
            erp_user: String::new(),
            erp_password: None,
            erp_database: "erp".to_string(),
            erp_encrypt: false,
            erp_trust_server_certificate: false,
            portal_engine: Engine::Sqlite,
            portal_host: "localhost".to_string(),
            portal_port: None,
            portal_user: String::new(),
            portal_password: None,
            portal_database: "portal.db".to_string(),
            portal_encrypt: false,
            portal_trust_server_certificate: false,
            tenants_file: None,
            default_company: DEFAULT_COMPANY.to_string(),
            secret_env_prefix: DEFAULT_SECRET_ENV_PREFIX.to_string(),
            max_connections: None,
            min_connections: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            query_timeout: DEFAULT_QUERY_TIMEOUT_SECS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            signature_ttl: DEFAULT_SIGNATURE_TTL_SECS,
            sat_endpoint: Url::parse(DEFAULT_SAT_ENDPOINT).expect("default SAT endpoint is valid"),
            sat_timeout: DEFAULT_SAT_TIMEOUT_SECS,
            http_host: DEFAULT_HTTP_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            enable_debug_endpoint: false,
            debug_capacity: DEFAULT_DEBUG_CAPACITY,
            auth_tokens: Vec::new(),
            enable_scheduler: false,
            scheduler_interval: DEFAULT_SCHEDULER_INTERVAL_SECS,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Default ERP target; tenants without an explicit target share it.
    pub fn erp_target(&self) -> ConnectionTarget {
        ConnectionTarget::new(
            self.erp_engine,
            &self.erp_host,
            self.erp_port,
            &self.erp_database,
            &self.erp_user,
            CredentialRef::new(ERP_CREDENTIAL),
        )
        .with_tls(TlsPolicy::from_flags(
            self.erp_encrypt,
            self.erp_trust_server_certificate,
        ))
    }

    /// Portal database target.
    pub fn portal_target(&self) -> ConnectionTarget {
        if self.portal_engine == Engine::Sqlite {
            return ConnectionTarget::sqlite(&self.portal_database);
        }
        ConnectionTarget::new(
            self.portal_engine,
            &self.portal_host,
            self.portal_port,
            &self.portal_database,
            &self.portal_user,
            CredentialRef::new(PORTAL_CREDENTIAL),
        )
        .with_tls(TlsPolicy::from_flags(
            self.portal_encrypt,
            self.portal_trust_server_certificate,
        ))
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            idle_timeout_secs: Some(self.idle_timeout),
            acquire_timeout_secs: None,
            test_before_acquire: None,
        }
    }

    /// Get the HTTP bind address.
    pub fn http_bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    /// Get the query timeout as a Duration.
    pub fn query_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    /// Get the connection timeout as a Duration.
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn signature_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.signature_ttl)
    }

    pub fn sat_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.sat_timeout)
    }

    pub fn scheduler_interval_duration(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
