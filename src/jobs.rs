//! Background revalidation of pending invoices.
//!
//! Invoices stay `Pendiente` when SAT could not be consulted. The scheduler
//! periodically asks SAT again for every active company.

use crate::db::{Connector, SqlBackend};
use crate::services::{PortalServices, RevalidationSummary};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Invoices revalidated per company per run.
pub const DEFAULT_REVALIDATION_BATCH: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduledRunStats {
    pub companies: usize,
    pub totals: RevalidationSummary,
    pub errors_encountered: usize,
}

pub struct RevalidationScheduler<C: Connector> {
    services: PortalServices<C>,
    interval: Duration,
    batch_size: u32,
}

impl<C> RevalidationScheduler<C>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    pub fn new(services: PortalServices<C>, interval: Duration) -> Self {
        Self {
            services,
            interval,
            batch_size: DEFAULT_REVALIDATION_BATCH,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// One sweep over every active company. A failing company is logged and skipped.
    pub async fn run_once(&self) -> ScheduledRunStats {
        let companies = self.services.resolver().directory().active_company_ids();
        let mut stats = ScheduledRunStats {
            companies: companies.len(),
            ..Default::default()
        };

        for company_id in &companies {
            match self
                .services
                .revalidate_pending(company_id, self.batch_size)
                .await
            {
                Ok(summary) => {
                    stats.totals.checked += summary.checked;
                    stats.totals.validated += summary.validated;
                    stats.totals.rejected += summary.rejected;
                    stats.totals.still_pending += summary.still_pending;
                    stats.totals.failed += summary.failed;
                }
                Err(e) => {
                    stats.errors_encountered += 1;
                    error!(company_id = %company_id, error = %e, "Pending invoice revalidation failed");
                }
            }
        }
        stats
    }

    /// Run forever on the configured interval. The first sweep starts immediately.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval_secs = self.interval.as_secs(),
                batch_size = self.batch_size,
                "Invoice revalidation scheduler started"
            );

            loop {
                interval.tick().await;
                let stats = self.run_once().await;
                info!(
                    companies = stats.companies,
                    checked = stats.totals.checked,
                    validated = stats.totals.validated,
                    rejected = stats.totals.rejected,
                    still_pending = stats.totals.still_pending,
                    errors = stats.errors_encountered + stats.totals.failed,
                    "Scheduled revalidation completed"
                );
            }
        })
    }
}
