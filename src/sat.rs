//! SAT CFDI status client.
//!
//! Queries the tax authority's `ConsultaCFDIService` SOAP endpoint for the
//! status of an invoice. Transport failures never surface as errors: they are
//! reported as `SatStatus::Error` so callers can keep the invoice pending and
//! try again later.

use crate::error::{PortalError, PortalResult};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const SOAP_ACTION: &str = "http://tempuri.org/IConsultaCFDIService/Consulta";

static ESTADO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:\w+:)?Estado>([^<]*)</(?:\w+:)?Estado>").expect("valid regex"));

static CODIGO_ESTATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:\w+:)?CodigoEstatus>([^<]*)</(?:\w+:)?CodigoEstatus>").expect("valid regex")
});

static RFC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-ZÑ&]{3,4}[0-9]{6}[A-Z0-9]{3}$").expect("valid regex"));

/// The four facts SAT needs to identify a CFDI.
#[derive(Debug, Clone, PartialEq)]
pub struct CfdiQuery {
    pub uuid: String,
    pub issuer_rfc: String,
    pub receiver_rfc: String,
    pub total: f64,
}

impl CfdiQuery {
    pub fn new(
        uuid: impl Into<String>,
        issuer_rfc: impl Into<String>,
        receiver_rfc: impl Into<String>,
        total: f64,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            issuer_rfc: issuer_rfc.into(),
            receiver_rfc: receiver_rfc.into(),
            total,
        }
    }

    /// Check the folio fiscal, both RFCs and the total before anything is sent.
    pub fn validate(&self) -> PortalResult<()> {
        if uuid::Uuid::parse_str(&self.uuid).is_err() {
            return Err(PortalError::invalid_input(format!(
                "Invalid CFDI UUID: {:?}",
                self.uuid
            )));
        }
        for rfc in [&self.issuer_rfc, &self.receiver_rfc] {
            if !is_valid_rfc(rfc) {
                return Err(PortalError::invalid_input(format!("Invalid RFC: {:?}", rfc)));
            }
        }
        if !self.total.is_finite() || self.total < 0.0 {
            return Err(PortalError::invalid_input("Invoice total must be a non-negative amount"));
        }
        Ok(())
    }

    /// `?re=..&rr=..&tt=..&id=..` with the total as 17 zero-padded digits, 6 decimals.
    pub fn expression(&self) -> String {
        format!(
            "?re={}&rr={}&tt={:017.6}&id={}",
            escape_rfc(&self.issuer_rfc),
            escape_rfc(&self.receiver_rfc),
            self.total,
            self.uuid.to_uppercase()
        )
    }
}

/// 12 characters for companies, 13 for individuals.
pub fn is_valid_rfc(rfc: &str) -> bool {
    RFC.is_match(rfc)
}

fn escape_rfc(rfc: &str) -> String {
    rfc.replace('&', "&amp;")
}

fn soap_envelope(expression: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:tem="http://tempuri.org/">"#,
            "<soapenv:Header/><soapenv:Body><tem:Consulta>",
            "<tem:expresionImpresa><![CDATA[{}]]></tem:expresionImpresa>",
            "</tem:Consulta></soapenv:Body></soapenv:Envelope>"
        ),
        expression
    )
}

/// Status reported by SAT for a CFDI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SatStatus {
    Vigente,
    Cancelado,
    NoEncontrado,
    /// The service could not be consulted; retry later.
    Error { reason: String },
}

impl SatStatus {
    /// Label stored in the invoice's `sat_status` column.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Vigente => "Vigente",
            Self::Cancelado => "Cancelado",
            Self::NoEncontrado => "No Encontrado",
            Self::Error { .. } => "Error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl std::fmt::Display for SatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error { reason } => write!(f, "Error ({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// Read `Estado` and `CodigoEstatus` out of a SOAP response body.
pub fn parse_response(body: &str) -> SatStatus {
    let field = |re: &Regex| {
        re.captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
    };
    let estado = field(&ESTADO);
    let codigo = field(&CODIGO_ESTATUS);

    if codigo.as_deref().is_some_and(|c| c.starts_with("N - 602")) {
        return SatStatus::NoEncontrado;
    }

    match estado.as_deref() {
        Some(e) if e.eq_ignore_ascii_case("Vigente") => SatStatus::Vigente,
        Some(e) if e.eq_ignore_ascii_case("Cancelado") => SatStatus::Cancelado,
        Some(e) if e.eq_ignore_ascii_case("No Encontrado") => SatStatus::NoEncontrado,
        Some(other) => SatStatus::Error {
            reason: format!("Unrecognized Estado: {:?}", other),
        },
        None => SatStatus::Error {
            reason: "Response has no Estado element".to_string(),
        },
    }
}

/// Client for the CFDI status web service.
#[derive(Debug, Clone)]
pub struct SatClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl SatClient {
    pub fn new(endpoint: Url, timeout: Duration) -> PortalResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PortalError::internal(format!("Failed to build SAT HTTP client: {}", e)))?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Ask SAT for the status of a CFDI.
    pub async fn verify(&self, query: &CfdiQuery) -> SatStatus {
        debug!(uuid = %query.uuid, "Consulting SAT");

        let response = self
            .http
            .post(self.endpoint.clone())
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .body(soap_envelope(&query.expression()))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let reason = if e.is_timeout() {
                    "SAT request timed out".to_string()
                } else {
                    format!("SAT request failed: {}", e)
                };
                warn!(uuid = %query.uuid, reason = %reason, "SAT consultation failed");
                return SatStatus::Error { reason };
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(uuid = %query.uuid, http_status = status.as_u16(), "SAT returned an error status");
            return SatStatus::Error {
                reason: format!("SAT responded with HTTP {}", status.as_u16()),
            };
        }

        match response.text().await {
            Ok(body) => {
                let result = parse_response(&body);
                debug!(uuid = %query.uuid, status = %result, "SAT answered");
                result
            }
            Err(e) => SatStatus::Error {
                reason: format!("Failed to read SAT response: {}", e),
            },
        }
    }
}
