//! Bearer-token guard for operator endpoints.
//!
//! Portal users authenticate at the fronting identity provider; this guard
//! only protects `/debug/*`, which exposes recent procedure calls.

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

/// Accepted operator tokens. An empty set disables the guard.
#[derive(Debug, Clone, Default)]
pub struct OperatorTokens {
    tokens: HashSet<String>,
}

impl OperatorTokens {
    pub fn from_tokens(tokens: Vec<String>) -> Result<Self, String> {
        let mut accepted = HashSet::with_capacity(tokens.len());
        for token in tokens {
            let token = token.trim();
            if token.is_empty() {
                return Err("Empty operator token in configuration".to_string());
            }
            accepted.insert(token.to_string());
        }
        Ok(Self { tokens: accepted })
    }

    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Compares against every configured token so timing does not reveal which matched.
    fn accepts(&self, provided: &str) -> bool {
        self.tokens.iter().fold(false, |found, expected| {
            found | constant_time_eq(provided.as_bytes(), expected.as_bytes())
        })
    }
}

pub async fn require_operator(
    State(tokens): State<Arc<OperatorTokens>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !tokens.is_enabled() {
        return next.run(request).await;
    }

    match bearer_token(&request) {
        Ok(token) if tokens.accepts(token) => next.run(request).await,
        Ok(token) => {
            warn!(token_prefix = %mask_token(token), "Operator token rejected");
            unauthorized("Invalid bearer token")
        }
        Err(reason) => {
            warn!(reason, "Operator request without usable credentials");
            unauthorized(reason)
        }
    }
}

fn bearer_token(request: &Request<Body>) -> Result<&str, &'static str> {
    let value = request
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or("Missing Authorization header")?
        .to_str()
        .map_err(|_| "Authorization header contains invalid characters")?;

    match value.strip_prefix("Bearer ") {
        Some(token) if !token.is_empty() => Ok(token),
        Some(_) => Err("Bearer token is empty"),
        None => Err("Expected 'Authorization: Bearer <token>'"),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn mask_token(token: &str) -> String {
    match token.get(..3) {
        Some(prefix) if token.len() > 3 => format!("{}***", prefix),
        _ => "***".to_string(),
    }
}

fn unauthorized(message: &str) -> Response {
    let body = json!({ "error": { "code": "unauthorized", "message": message } });
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(body),
    )
        .into_response()
}
