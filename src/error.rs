//! Error types for the supplier portal gateway.
//!
//! This module defines all error types using `thiserror`. Variants follow the
//! layer that raises them: connection registry, tenant resolver, procedure
//! invoker, SAT validator, and the domain functions built on top of them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Distinguishable reasons a database handshake or session can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    BadCredentials,
    Unreachable,
    Tls,
    Timeout,
    Closed,
    Configuration,
    Other,
}

impl ConnectionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadCredentials => "bad_credentials",
            Self::Unreachable => "unreachable",
            Self::Tls => "tls",
            Self::Timeout => "timeout",
            Self::Closed => "closed",
            Self::Configuration => "configuration",
            Self::Other => "other",
        }
    }

    /// Whether a caller may retry after this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable | Self::Timeout | Self::Closed)
    }
}

impl std::fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a database-level execution error should be read by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionClass {
    /// Raised deliberately by a routine (e.g. SIGNAL / RAISE / RAISERROR).
    Rejected,
    /// Unique, foreign-key, not-null or check constraint.
    Constraint,
    /// Anything else the server reported.
    Database,
}

impl ExecutionClass {
    pub fn is_business(&self) -> bool {
        matches!(self, Self::Rejected | Self::Constraint)
    }
}

#[derive(Error, Debug, Clone)]
pub enum PortalError {
    #[error("Connection failed ({kind}): {message}")]
    Connection {
        kind: ConnectionErrorKind,
        message: String,
        suggestion: String,
    },

    #[error("Unknown tenant: {company_id}")]
    UnknownTenant { company_id: String },

    #[error("Tenant is inactive: {company_id}")]
    InactiveTenant { company_id: String },

    #[error("Stored procedure not found: {procedure}")]
    ProcedureNotFound { procedure: String },

    #[error("Parameter mismatch calling {procedure}: {detail}")]
    ParameterMismatch { procedure: String, detail: String },

    #[error("Execution failed: {message}")]
    Execution {
        procedure: Option<String>,
        /// Native error number or SQLSTATE reported by the server
        code: Option<String>,
        message: String,
        class: ExecutionClass,
    },

    #[error("CFDI {uuid} rejected by SAT: {status}")]
    Validation { uuid: String, status: String },

    #[error("Service unavailable: {service} - {message}")]
    ServiceUnavailable { service: String, message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PortalError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(
        kind: ConnectionErrorKind,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Connection {
            kind,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn timeout(operation: impl AsRef<str>, secs: u64) -> Self {
        Self::connection(
            ConnectionErrorKind::Timeout,
            format!("{} exceeded {}s", operation.as_ref(), secs),
            "Consider increasing the timeout or checking server load",
        )
    }

    pub fn unknown_tenant(company_id: impl Into<String>) -> Self {
        Self::UnknownTenant {
            company_id: company_id.into(),
        }
    }

    pub fn inactive_tenant(company_id: impl Into<String>) -> Self {
        Self::InactiveTenant {
            company_id: company_id.into(),
        }
    }

    pub fn procedure_not_found(procedure: impl Into<String>) -> Self {
        Self::ProcedureNotFound {
            procedure: procedure.into(),
        }
    }

    pub fn parameter_mismatch(procedure: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ParameterMismatch {
            procedure: procedure.into(),
            detail: detail.into(),
        }
    }

    /// Create an execution error with an optional native code.
    pub fn execution(
        code: Option<String>,
        message: impl Into<String>,
        class: ExecutionClass,
    ) -> Self {
        Self::Execution {
            procedure: None,
            code,
            message: message.into(),
            class,
        }
    }

    pub fn validation(uuid: impl Into<String>, status: impl Into<String>) -> Self {
        Self::Validation {
            uuid: uuid.into(),
            status: status.into(),
        }
    }

    pub fn service_unavailable(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach the procedure name to an execution error raised while calling it.
    pub fn in_procedure(self, name: &str) -> Self {
        match self {
            Self::Execution {
                procedure: None,
                code,
                message,
                class,
            } => Self::Execution {
                procedure: Some(name.to_string()),
                code,
                message,
                class,
            },
            other => other,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { kind, .. } => kind.is_transient(),
            Self::ServiceUnavailable { .. } => true,
            _ => false,
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            Self::Connection { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Short machine-readable name, used in diagnostics and response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection_error",
            Self::UnknownTenant { .. } => "unknown_tenant",
            Self::InactiveTenant { .. } => "inactive_tenant",
            Self::ProcedureNotFound { .. } => "procedure_not_found",
            Self::ParameterMismatch { .. } => "parameter_mismatch",
            Self::Execution { .. } => "execution_error",
            Self::Validation { .. } => "validation_error",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::NotFound { .. } => "not_found",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Internal { .. } => "internal_error",
        }
    }
}

/// Classify a driver error raised while a statement was running.
///
/// Handshake failures are classified separately by the connector, which knows
/// it is still connecting.
impl From<sqlx::Error> for PortalError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => PortalError::connection(
                ConnectionErrorKind::Configuration,
                msg.to_string(),
                "Check the connection settings",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let class = classify_database_error(db_err.as_ref());
                PortalError::execution(code, db_err.message(), class)
            }
            sqlx::Error::RowNotFound => PortalError::not_found("row", "query returned no rows"),
            sqlx::Error::PoolTimedOut => PortalError::connection(
                ConnectionErrorKind::Timeout,
                "Timed out acquiring a pooled connection",
                "The pool is saturated; retry later or raise max_connections",
            ),
            sqlx::Error::PoolClosed => PortalError::connection(
                ConnectionErrorKind::Closed,
                "Connection pool is closed",
                "The target was released; acquire it again",
            ),
            sqlx::Error::Io(io_err) => {
                let kind = if io_err.kind() == std::io::ErrorKind::TimedOut {
                    ConnectionErrorKind::Timeout
                } else {
                    ConnectionErrorKind::Unreachable
                };
                PortalError::connection(
                    kind,
                    format!("I/O error: {}", io_err),
                    "Check network connectivity and database server status",
                )
            }
            sqlx::Error::Tls(tls_err) => PortalError::connection(
                ConnectionErrorKind::Tls,
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => PortalError::connection(
                ConnectionErrorKind::Other,
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                PortalError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                PortalError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => PortalError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => PortalError::connection(
                ConnectionErrorKind::Closed,
                "Database worker crashed",
                "Acquire the connection again",
            ),
            _ => PortalError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

fn classify_database_error(err: &dyn sqlx::error::DatabaseError) -> ExecutionClass {
    use sqlx::error::ErrorKind;

    match err.kind() {
        ErrorKind::UniqueViolation
        | ErrorKind::ForeignKeyViolation
        | ErrorKind::NotNullViolation
        | ErrorKind::CheckViolation => ExecutionClass::Constraint,
        _ => {
            let code = err.code();
            let code = code.as_deref().unwrap_or_default();
            // MySQL SIGNAL '45000' and Postgres RAISE EXCEPTION 'P0001' are user-raised
            if code == "45000" || code == "P0001" {
                ExecutionClass::Rejected
            } else {
                ExecutionClass::Database
            }
        }
    }
}

/// Result type alias for gateway operations.
pub type PortalResult<T> = Result<T, PortalError>;

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    db_code: Option<String>,
}

/// Render an error for HTTP clients.
///
/// Infrastructure failures get a generic message; the full error goes to the
/// server log only.
impl IntoResponse for PortalError {
    fn into_response(self) -> Response {
        let (status, message, db_code) = match &self {
            PortalError::Connection { .. } | PortalError::ServiceUnavailable { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "A backing service is temporarily unavailable".to_string(),
                None,
            ),
            PortalError::UnknownTenant { .. }
            | PortalError::InactiveTenant { .. }
            | PortalError::ProcedureNotFound { .. }
            | PortalError::ParameterMismatch { .. }
            | PortalError::Internal { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "The request could not be completed".to_string(),
                None,
            ),
            PortalError::Execution {
                code,
                message,
                class,
                ..
            } if class.is_business() => (
                StatusCode::UNPROCESSABLE_ENTITY,
                message.clone(),
                code.clone(),
            ),
            PortalError::Execution { code, .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "The database rejected the operation".to_string(),
                code.clone(),
            ),
            PortalError::Validation { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string(), None)
            }
            PortalError::NotFound { .. } => (StatusCode::NOT_FOUND, self.to_string(), None),
            PortalError::InvalidInput { .. } => (StatusCode::BAD_REQUEST, self.to_string(), None),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        } else {
            tracing::debug!(error = %self, code = self.code(), "Request rejected");
        }

        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message,
                db_code,
            },
        };
        (status, axum::Json(body)).into_response()
    }
}
