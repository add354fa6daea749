//! Tenant directory and resolver.
//!
//! Maps a company id to the ERP target that holds its data and to how that
//! data is isolated (own database, or shared database plus a row filter).
//! The directory is loaded from a TOML file:
//!
//! ```toml
//! [[tenant]]
//! company_id = "ACME"
//! name = "Acme SA de CV"
//! isolation = { mode = "shared_row", column = "Empresa", value = "ACME" }
//!
//! [[tenant]]
//! company_id = "GLOBEX"
//! isolation = { mode = "database" }
//! [tenant.target]
//! engine = "mysql"
//! host = "erp-globex"
//! database = "globex"
//! user = "portal"
//! credential = "globex"
//! ```
//!
//! Tenants without a `target` use the default ERP target from configuration.

use crate::error::{PortalError, PortalResult};
use crate::models::{ConnectionTarget, RowFilter, TenantContext, TenantRoute};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Isolation mode as written in the tenants file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Isolation {
    #[default]
    Database,
    SharedRow {
        column: String,
        value: String,
    },
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantEntry {
    pub company_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub target: Option<ConnectionTarget>,
    #[serde(default)]
    pub isolation: Isolation,
}

#[derive(Debug, Deserialize)]
struct TenantFile {
    #[serde(default)]
    tenant: Vec<TenantEntry>,
}

/// A validated tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub company_id: String,
    pub name: Option<String>,
    pub active: bool,
    pub route: TenantRoute,
}

impl Tenant {
    pub fn target(&self) -> &ConnectionTarget {
        match &self.route {
            TenantRoute::PerDatabase(target) => target,
            TenantRoute::SharedWithFilter { target, .. } => target,
        }
    }
}

/// Immutable table of tenants keyed by company id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantDirectory {
    tenants: HashMap<String, Tenant>,
}

impl TenantDirectory {
    /// Parse a tenants file. Row-filter columns are validated here, not at
    /// query time.
    pub fn from_toml(text: &str, default_target: &ConnectionTarget) -> PortalResult<Self> {
        let file: TenantFile = toml::from_str(text)
            .map_err(|e| PortalError::invalid_input(format!("Invalid tenants file: {}", e)))?;
        Self::from_entries(file.tenant, default_target)
    }

    pub fn load(path: &Path, default_target: &ConnectionTarget) -> PortalResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PortalError::invalid_input(format!(
                "Cannot read tenants file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&contents, default_target)
    }

    pub fn from_entries(
        entries: Vec<TenantEntry>,
        default_target: &ConnectionTarget,
    ) -> PortalResult<Self> {
        let mut tenants = HashMap::with_capacity(entries.len());

        for entry in entries {
            let company_id = entry.company_id.trim().to_string();
            if company_id.is_empty() {
                return Err(PortalError::invalid_input("Tenant company_id cannot be empty"));
            }

            let target = entry.target.unwrap_or_else(|| default_target.clone());
            let route = match entry.isolation {
                Isolation::Database => TenantRoute::PerDatabase(target),
                Isolation::SharedRow { column, value } => TenantRoute::SharedWithFilter {
                    target,
                    filter: RowFilter::new(column, value)?,
                },
            };

            let tenant = Tenant {
                company_id: company_id.clone(),
                name: entry.name,
                active: entry.active,
                route,
            };
            if tenants.insert(company_id.clone(), tenant).is_some() {
                return Err(PortalError::invalid_input(format!(
                    "Duplicate tenant company_id: {}",
                    company_id
                )));
            }
        }

        Ok(Self { tenants })
    }

    /// A directory with one per-database tenant.
    pub fn single(company_id: impl Into<String>, target: ConnectionTarget) -> Self {
        let company_id = company_id.into();
        let tenant = Tenant {
            company_id: company_id.clone(),
            name: None,
            active: true,
            route: TenantRoute::PerDatabase(target),
        };
        Self {
            tenants: HashMap::from([(company_id, tenant)]),
        }
    }

    pub fn get(&self, company_id: &str) -> Option<&Tenant> {
        self.tenants.get(company_id)
    }

    /// Active company ids, sorted.
    pub fn active_company_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tenants
            .values()
            .filter(|t| t.active)
            .map(|t| t.company_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    fn targets(&self) -> impl Iterator<Item = &ConnectionTarget> {
        self.tenants.values().map(Tenant::target)
    }
}

/// Resolves company ids against the current directory.
///
/// Uses std::sync::RwLock: resolution is synchronous and the lock is never
/// held across an await point.
#[derive(Debug)]
pub struct TenantResolver {
    directory: RwLock<Arc<TenantDirectory>>,
}

impl TenantResolver {
    pub fn new(directory: TenantDirectory) -> Self {
        Self {
            directory: RwLock::new(Arc::new(directory)),
        }
    }

    pub fn directory(&self) -> Arc<TenantDirectory> {
        Arc::clone(&self.directory.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Routing for `company_id`. The same directory always yields the same context.
    pub fn resolve(&self, company_id: &str) -> PortalResult<TenantContext> {
        let directory = self.directory();
        let tenant = directory
            .get(company_id)
            .ok_or_else(|| PortalError::unknown_tenant(company_id))?;
        if !tenant.active {
            return Err(PortalError::inactive_tenant(company_id));
        }
        Ok(TenantContext {
            company_id: tenant.company_id.clone(),
            route: tenant.route.clone(),
        })
    }

    /// Swap in a new directory. Returns the targets that are no longer used
    /// with identical connection details; their pools should be released.
    pub fn replace(&self, directory: TenantDirectory) -> Vec<ConnectionTarget> {
        let previous = {
            let mut guard = self
                .directory
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, Arc::new(directory))
        }; // Lock released here

        let current = self.directory();
        let mut stale: Vec<ConnectionTarget> = Vec::new();
        for target in previous.targets() {
            let still_used = current.targets().any(|t| t == target);
            if !still_used && !stale.iter().any(|s| s == target) {
                stale.push(target.clone());
            }
        }
        stale.sort_by(|a, b| a.key().cmp(&b.key()));

        info!(
            tenants = current.len(),
            stale_targets = stale.len(),
            "Tenant directory replaced"
        );
        stale
    }
}
