//! Lease Coordinator
//!
//! Fast failover: the instance writes its node identity into the volume's
//! lease record before serving and keeps renewing it. A failed take stops
//! the instance from serving. A failed renewal is logged and ends renewal;
//! the cluster is expected to terminate an instance that lost its lease.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::{LeaseRecord, LeaseStore};
use crate::error::{Error, Result};
use crate::metrics;

/// Default renewal period
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(3);

/// Takes and renews the failover lease of one volume.
pub struct LeaseCoordinator {
    store: Arc<dyn LeaseStore>,
    name: String,
    holder: String,
    lease: Mutex<Option<LeaseRecord>>,
}

impl LeaseCoordinator {
    /// `name` is the lease (volume) name, `holder` this instance's identity.
    pub fn new(store: Arc<dyn LeaseStore>, name: impl Into<String>, holder: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            holder: holder.into(),
            lease: Mutex::new(None),
        }
    }

    /// Last lease record written by this coordinator.
    pub fn lease(&self) -> Option<LeaseRecord> {
        self.lease.lock().clone()
    }

    /// Overwrite the holder with this instance and bump the transition count.
    #[instrument(skip(self), fields(lease = %self.name, holder = %self.holder))]
    pub async fn take(&self) -> Result<LeaseRecord> {
        let result = self.try_take().await;
        metrics::LEASE_UPDATES
            .with_label_values(&["take", metrics::outcome(&result)])
            .inc();
        result
    }

    async fn try_take(&self) -> Result<LeaseRecord> {
        let mut lease = self.store.get(&self.name).await?;
        let now = Utc::now();
        let previous = std::mem::replace(&mut lease.holder_identity, self.holder.clone());
        lease.lease_transitions += 1;
        lease.acquire_time = Some(now);
        lease.renew_time = Some(now);

        let updated = self.store.update(&lease).await?;
        info!(
            previous_holder = %previous,
            transitions = updated.lease_transitions,
            "Took over failover lease"
        );
        *self.lease.lock() = Some(updated.clone());
        Ok(updated)
    }

    /// Refresh the renew time of the lease taken earlier.
    #[instrument(skip(self), fields(lease = %self.name))]
    pub async fn renew(&self) -> Result<LeaseRecord> {
        let result = self.try_renew().await;
        metrics::LEASE_UPDATES
            .with_label_values(&["renew", metrics::outcome(&result)])
            .inc();
        result
    }

    async fn try_renew(&self) -> Result<LeaseRecord> {
        let mut lease = self
            .lease()
            .ok_or_else(|| Error::Lease(format!("lease {} was never taken", self.name)))?;
        lease.renew_time = Some(Utc::now());

        let updated = self.store.update(&lease).await?;
        debug!(renew_time = ?updated.renew_time, "Renewed failover lease");
        *self.lease.lock() = Some(updated.clone());
        Ok(updated)
    }

    /// Renew on every tick until cancelled or a renewal fails.
    ///
    /// The lease is never released; the next instance's take overwrites it.
    pub async fn run_renewal(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the lease was just taken.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(lease = %self.name, "Lease renewal stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let renewed = tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(lease = %self.name, "Lease renewal stopped");
                            return;
                        }
                        renewed = self.renew() => renewed,
                    };
                    if let Err(e) = renewed {
                        warn!(
                            lease = %self.name,
                            "Failed to renew failover lease, expect to be terminated: {}",
                            e
                        );
                        return;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for LeaseCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseCoordinator")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .finish()
    }
}
