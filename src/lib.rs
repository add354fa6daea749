//! Supplier Portal Gateway Library
//!
//! Multi-tenant data gateway between a supplier portal and its ERP:
//! tenant routing, single-flight connection pooling, catalog-checked stored
//! procedure calls, CFDI validation against SAT and the portal's own records.

pub mod auth;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod http;
pub mod invoker;
pub mod jobs;
pub mod models;
pub mod sat;
pub mod services;
pub mod tenant;

pub use config::Config;
pub use error::{PortalError, PortalResult};
pub use invoker::ProcedureInvoker;
pub use services::PortalServices;
pub use tenant::{TenantDirectory, TenantResolver};
