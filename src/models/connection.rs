//! Connection-target data models.
//!
//! A `ConnectionTarget` identifies one reachable database. It carries a
//! reference to a credential, never the credential itself, and that reference
//! is kept out of `Debug` output, serialization and the canonical key.

use serde::{Deserialize, Serialize};

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Includes MariaDB
    MySql,
    Postgres,
    Sqlite,
}

impl Engine {
    /// Get the display name for this engine.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::MySql => "MySQL",
            Self::Postgres => "PostgreSQL",
            Self::Sqlite => "SQLite",
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    /// Get the default port for this engine.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySql => Some(3306),
            Self::Sqlite => None,
        }
    }

    /// Whether the engine can run stored routines.
    pub fn supports_procedures(&self) -> bool {
        !matches!(self, Self::Sqlite)
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("Unknown database engine: {}", other)),
        }
    }
}

/// Transport encryption policy for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TlsPolicy {
    Disabled,
    #[default]
    Preferred,
    Required {
        /// Skip certificate chain verification (self-signed ERP servers)
        #[serde(default)]
        trust_server_certificate: bool,
    },
}

impl TlsPolicy {
    /// Build from the encrypt / trust-certificate flag pair used in deployment config.
    pub fn from_flags(encrypt: bool, trust_server_certificate: bool) -> Self {
        if encrypt {
            Self::Required {
                trust_server_certificate,
            }
        } else {
            Self::Preferred
        }
    }
}

/// Name of a secret held by the credential vault.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(String);

impl CredentialRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialRef(***)")
    }
}

/// Canonical registry key for a target: engine, user, host, port and database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TargetKey(String);

impl TargetKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One reachable database.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub engine: Engine,
    /// Ignored for SQLite
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Database name, or the file path for SQLite
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(skip_serializing)]
    pub credential: CredentialRef,
    #[serde(default)]
    pub tls: TlsPolicy,
}

impl ConnectionTarget {
    pub fn new(
        engine: Engine,
        host: impl Into<String>,
        port: Option<u16>,
        database: impl Into<String>,
        user: impl Into<String>,
        credential: CredentialRef,
    ) -> Self {
        Self {
            engine,
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            credential,
            tls: TlsPolicy::default(),
        }
    }

    /// A SQLite file target (no host, user or secret).
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self::new(Engine::Sqlite, "", None, path, "", CredentialRef::new("none"))
    }

    pub fn with_tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    /// Port, falling back to the engine default.
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.engine.default_port())
    }

    /// Canonical key: `engine://user@host:port/database`, never including the credential.
    pub fn key(&self) -> TargetKey {
        match self.engine {
            Engine::Sqlite => TargetKey(format!("sqlite:{}", self.database)),
            engine => TargetKey(format!(
                "{}://{}@{}:{}/{}",
                engine.scheme(),
                self.user,
                self.host.to_ascii_lowercase(),
                self.effective_port().unwrap_or_default(),
                self.database
            )),
        }
    }

    /// Whether the engine needs a password from the vault.
    pub fn needs_secret(&self) -> bool {
        self.engine != Engine::Sqlite
    }

    /// Log-safe description of this target.
    pub fn summary(&self) -> TargetSummary {
        TargetSummary {
            engine: self.engine,
            host: self.host.clone(),
            port: self.effective_port(),
            database: self.database.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Target description safe for logs and diagnostics (no user, no credential).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub engine: Engine,
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
}

impl std::fmt::Display for TargetSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(
                f,
                "{}://{}:{}/{}",
                self.engine.scheme(),
                self.host,
                port,
                self.database
            ),
            None => write!(f, "{}:{}", self.engine.scheme(), self.database),
        }
    }
}
