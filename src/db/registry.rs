//! Connection registry: one live pool per connection target.
//!
//! # Design Decisions
//!
//! - **Shared connect future per target key**: the first `acquire` installs a
//!   `futures_util::future::Shared` handshake; overlapping callers clone it and
//!   observe the same pool or the same error. `tokio::sync::OnceCell` is not
//!   used because it does not hand a failure to the waiters.
//! - **Generation numbers**: a waiter only finalizes the slot it started from,
//!   so a `release` or a newer attempt during a handshake is never overwritten.
//! - **Failure evicts**: a failed handshake leaves no entry behind and the next
//!   caller starts a fresh attempt.
//! - **Weak reaper**: the idle reaper holds a `Weak` reference and exits when
//!   the registry is dropped.
//!
//! No lock is held across an await point.

use crate::db::credentials::{CredentialVault, Secret};
use crate::db::pool::Connector;
use crate::error::{ConnectionErrorKind, PortalError, PortalResult};
use crate::models::{ConnectionTarget, TargetKey, TargetSummary};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type ConnectFuture<P> = Shared<BoxFuture<'static, PortalResult<P>>>;

/// Registry timing configuration.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(crate::config::DEFAULT_CONNECT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(crate::config::DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

struct ReadyEntry<P> {
    pool: P,
    summary: TargetSummary,
    generation: u64,
    /// std lock: touched synchronously, never held across await
    last_used: std::sync::RwLock<Instant>,
}

impl<P> ReadyEntry<P> {
    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.write() {
            *last_used = Instant::now();
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        self.last_used
            .read()
            .map(|t| now.saturating_duration_since(*t))
            .unwrap_or_default()
    }
}

enum Slot<P> {
    Connecting {
        generation: u64,
        future: ConnectFuture<P>,
        summary: TargetSummary,
    },
    Ready(Arc<ReadyEntry<P>>),
}

struct RegistryInner<C: Connector> {
    connector: Arc<C>,
    vault: CredentialVault,
    config: RegistryConfig,
    slots: RwLock<HashMap<TargetKey, Slot<C::Pool>>>,
    next_generation: AtomicU64,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Drop for RegistryInner<C> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.reaper.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Holds one pool per distinct `ConnectionTarget`, created on first use.
pub struct ConnectionRegistry<C: Connector> {
    inner: Arc<RegistryInner<C>>,
}

impl<C: Connector> Clone for ConnectionRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum Plan<P> {
    Hit(P),
    Wait(u64, ConnectFuture<P>),
}

impl<C: Connector> ConnectionRegistry<C> {
    pub fn new(connector: C, vault: CredentialVault, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connector: Arc::new(connector),
                vault,
                config,
                slots: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                reaper: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Return the pool for `target`, performing the handshake if needed.
    ///
    /// Concurrent calls for the same target share one handshake and one outcome.
    pub async fn acquire(&self, target: &ConnectionTarget) -> PortalResult<C::Pool> {
        let key = target.key();

        // Fast path: read lock only
        let shortcut = {
            let slots = self.inner.slots.read().await;
            match slots.get(&key) {
                Some(Slot::Ready(entry)) if self.inner.connector.is_open(&entry.pool) => {
                    entry.touch();
                    Some(Plan::Hit(entry.pool.clone()))
                }
                Some(Slot::Connecting {
                    generation, future, ..
                }) => Some(Plan::Wait(*generation, future.clone())),
                _ => None,
            }
        }; // Read lock released here

        match shortcut {
            Some(Plan::Hit(pool)) => return Ok(pool),
            Some(Plan::Wait(generation, future)) => {
                return self.finish(&key, generation, future).await;
            }
            None => {}
        }

        let plan = {
            let mut slots = self.inner.slots.write().await;
            // Double-check after acquiring write lock
            let existing = match slots.get(&key) {
                Some(Slot::Ready(entry)) if self.inner.connector.is_open(&entry.pool) => {
                    entry.touch();
                    Ok(Plan::Hit(entry.pool.clone()))
                }
                Some(Slot::Connecting {
                    generation, future, ..
                }) => Ok(Plan::Wait(*generation, future.clone())),
                stale => Err(stale.is_some()),
            };

            match existing {
                Ok(plan) => plan,
                Err(stale) => {
                    if stale {
                        warn!(target = %target.summary(), "Cached pool is closed, reconnecting");
                    }
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    let future = self.connect_future(target);
                    slots.insert(
                        key.clone(),
                        Slot::Connecting {
                            generation,
                            future: future.clone(),
                            summary: target.summary(),
                        },
                    );
                    Plan::Wait(generation, future)
                }
            }
        }; // Write lock released here

        match plan {
            Plan::Hit(pool) => Ok(pool),
            Plan::Wait(generation, future) => self.finish(&key, generation, future).await,
        }
    }

    /// Build the shared handshake future. The secret is fetched inside it and
    /// dropped as soon as the connector returns.
    fn connect_future(&self, target: &ConnectionTarget) -> ConnectFuture<C::Pool> {
        let connector = Arc::clone(&self.inner.connector);
        let vault = self.inner.vault.clone();
        let target = target.clone();
        let connect_timeout = self.inner.config.connect_timeout;

        async move {
            let secret = if target.needs_secret() {
                vault.fetch(&target.credential)?
            } else {
                Secret::empty()
            };
            match tokio::time::timeout(connect_timeout, connector.connect(&target, secret)).await
            {
                Ok(result) => result,
                Err(_) => Err(PortalError::timeout(
                    format!("Connecting to {}", target.summary()),
                    connect_timeout.as_secs(),
                )),
            }
        }
        .boxed()
        .shared()
    }

    async fn finish(
        &self,
        key: &TargetKey,
        generation: u64,
        future: ConnectFuture<C::Pool>,
    ) -> PortalResult<C::Pool> {
        let result = future.await;

        let orphaned = {
            let mut slots = self.inner.slots.write().await;
            let owned_summary = match slots.get(key) {
                Some(Slot::Connecting {
                    generation: g,
                    summary,
                    ..
                }) if *g == generation => Some(summary.clone()),
                _ => None,
            };

            match owned_summary {
                Some(summary) => {
                    match &result {
                        Ok(pool) => {
                            slots.insert(
                                key.clone(),
                                Slot::Ready(Arc::new(ReadyEntry {
                                    pool: pool.clone(),
                                    summary,
                                    generation,
                                    last_used: std::sync::RwLock::new(Instant::now()),
                                })),
                            );
                        }
                        Err(e) => {
                            slots.remove(key);
                            debug!(target = %summary, error = %e, "Handshake failed, slot evicted");
                        }
                    }
                    false
                }
                None => {
                    let finalized_by_sibling = matches!(
                        slots.get(key),
                        Some(Slot::Ready(entry)) if entry.generation == generation
                    );
                    // Released or superseded while the handshake was in flight
                    !finalized_by_sibling && result.is_ok()
                }
            }
        }; // Write lock released here

        if orphaned {
            if let Ok(pool) = &result {
                self.inner.connector.close(pool).await;
            }
            return Err(PortalError::connection(
                ConnectionErrorKind::Closed,
                "Target was released while connecting",
                "Acquire the target again",
            ));
        }

        result
    }

    /// Close and evict the pool for `target`. Returns whether an entry existed.
    pub async fn release(&self, target: &ConnectionTarget) -> bool {
        let removed = {
            let mut slots = self.inner.slots.write().await;
            slots.remove(&target.key())
        }; // Lock released here

        match removed {
            Some(Slot::Ready(entry)) => {
                info!(target = %target.summary(), "Releasing connection pool");
                self.inner.connector.close(&entry.pool).await;
                true
            }
            Some(Slot::Connecting { .. }) => {
                info!(target = %target.summary(), "Released target with handshake in flight");
                true
            }
            None => false,
        }
    }

    /// Close every pool and stop the idle reaper.
    pub async fn close_all(&self) {
        if let Ok(mut guard) = self.inner.reaper.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }

        let drained: Vec<_> = {
            let mut slots = self.inner.slots.write().await;
            slots.drain().collect()
        }; // Lock released here

        for (key, slot) in drained {
            if let Slot::Ready(entry) = slot {
                info!(target = %entry.summary, "Closing connection pool");
                self.inner.connector.close(&entry.pool).await;
            } else {
                debug!(target = %key, "Dropping in-flight handshake");
            }
        }
        info!("All connection pools closed");
    }

    /// Number of established pools.
    pub async fn pool_count(&self) -> usize {
        let slots = self.inner.slots.read().await;
        slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Log-safe descriptions of the established pools.
    pub async fn targets(&self) -> Vec<TargetSummary> {
        let slots = self.inner.slots.read().await;
        let mut summaries: Vec<TargetSummary> = slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(entry) => Some(entry.summary.clone()),
                Slot::Connecting { .. } => None,
            })
            .collect();
        summaries.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        summaries
    }

    /// Spawn the background task that closes pools idle for longer than the
    /// configured idle timeout. Calling it again replaces the previous task.
    pub fn start_idle_reaper(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let idle_timeout = self.inner.config.idle_timeout;
        let handle = tokio::spawn(async move {
            Self::reap_idle(weak, interval, idle_timeout).await;
        });

        if let Ok(mut guard) = self.inner.reaper.lock() {
            if let Some(previous) = guard.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Collect candidates under a read lock, remove under a brief write lock,
    /// close outside all locks.
    async fn reap_idle(weak: Weak<RegistryInner<C>>, interval: Duration, idle_timeout: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(inner) = weak.upgrade() else {
                debug!("Connection registry dropped, idle reaper exiting");
                return;
            };

            let now = Instant::now();
            let candidates: Vec<TargetKey> = {
                let slots = inner.slots.read().await;
                slots
                    .iter()
                    .filter_map(|(key, slot)| match slot {
                        Slot::Ready(entry) if entry.idle_for(now) > idle_timeout => {
                            Some(key.clone())
                        }
                        _ => None,
                    })
                    .collect()
            }; // Read lock released here

            for key in candidates {
                let removed = {
                    let mut slots = inner.slots.write().await;
                    // Re-check after acquiring the write lock
                    let still_idle = matches!(
                        slots.get(&key),
                        Some(Slot::Ready(entry)) if entry.idle_for(Instant::now()) > idle_timeout
                    );
                    if still_idle { slots.remove(&key) } else { None }
                };

                if let Some(Slot::Ready(entry)) = removed {
                    info!(target = %entry.summary, "Closing idle connection pool");
                    inner.connector.close(&entry.pool).await;
                }
            }

            // Drop strong reference before sleeping
            drop(inner);
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
