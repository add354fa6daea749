//! Scoped secret acquisition.
//!
//! Targets only carry a `CredentialRef`. The connector asks the vault for the
//! matching `Secret` right before a handshake and drops it afterwards, so no
//! pool, registry entry or log line ever holds a password.

use crate::error::{ConnectionErrorKind, PortalError, PortalResult};
use crate::models::CredentialRef;
use std::collections::HashMap;
use std::sync::Arc;

/// A password. Never printed, never serialized.
#[derive(Clone)]
pub struct Secret(Arc<str>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::from(value.into()))
    }

    /// An empty secret, used for targets that need no password (SQLite).
    pub fn empty() -> Self {
        Self::new(String::new())
    }

    /// Borrow the plaintext. Only connectors call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

/// Resolves credential references to secrets.
///
/// Secrets registered at startup win; otherwise the environment variable
/// `<prefix><NAME>` is read at fetch time (name upper-cased, `-` and `.`
/// mapped to `_`).
#[derive(Clone)]
pub struct CredentialVault {
    registered: Arc<HashMap<String, Secret>>,
    env_prefix: String,
}

impl CredentialVault {
    pub fn new(env_prefix: impl Into<String>) -> Self {
        Self {
            registered: Arc::new(HashMap::new()),
            env_prefix: env_prefix.into(),
        }
    }

    /// Register a secret under `name`. Empty values are ignored.
    pub fn with_secret(mut self, name: &str, value: Option<String>) -> Self {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            Arc::make_mut(&mut self.registered).insert(name.to_string(), Secret::new(value));
        }
        self
    }

    /// Environment variable consulted for `reference`.
    pub fn env_var_name(&self, reference: &CredentialRef) -> String {
        let suffix: String = reference
            .name()
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{}", self.env_prefix, suffix)
    }

    /// Fetch the secret for `reference`.
    pub fn fetch(&self, reference: &CredentialRef) -> PortalResult<Secret> {
        if let Some(secret) = self.registered.get(reference.name()) {
            return Ok(secret.clone());
        }

        let var = self.env_var_name(reference);
        match std::env::var(&var) {
            Ok(value) => Ok(Secret::new(value)),
            Err(_) => Err(PortalError::connection(
                ConnectionErrorKind::Configuration,
                format!("No secret available for credential '{}'", reference.name()),
                format!("Set {} or configure the password flag", var),
            )),
        }
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.registered.keys().collect();
        names.sort();
        f.debug_struct("CredentialVault")
            .field("registered", &names)
            .field("env_prefix", &self.env_prefix)
            .finish()
    }
}
