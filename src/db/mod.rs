//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Credential vault and scoped secrets
//! - Connection pools and the single-flight connection registry
//! - Statement execution behind the `SqlBackend` seam
//! - Stored-routine catalog introspection and signature cache
//! - Type mappings and parameter binding
//! - Database dispatch macros for reducing code duplication

pub mod catalog;
pub mod credentials;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod registry;
pub mod types;

pub use catalog::{SignatureCache, render_call};
pub use credentials::{CredentialVault, Secret};
pub use executor::{DbTransaction, SqlBackend, SqlTransaction};
pub use pool::{Connector, DbPool, SqlxConnector};
pub use registry::{ConnectionRegistry, RegistryConfig};
