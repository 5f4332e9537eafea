//! Claim-and-reconcile loop converging this host with the fleet's desired
//! state.
//!
//! Each tick the agent:
//! 1. Publishes its heartbeat (host record with a fresh lease)
//! 2. Lists the desired and claimed directories, races claims for
//!    unclaimed placements, and realizes the ones it wins
//! 3. Tears down local instances whose placement left the desired set
//! 4. Refreshes the claim for every instance it still runs
//!
//! Transient store failures skip the tick and retry on the next one; the
//! held leases ride out the gap as long as the store recovers within the
//! lease window. Anything else tears down local instances and exits.

use std::sync::Arc;
use std::time::Duration;

use corral_coord::{CoordError, CoordStore};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::claim::{ClaimManager, ClaimOutcome};
use crate::config::Config;
use crate::heartbeat::Heartbeat;
use crate::keys;
use crate::lifecycle::InstanceLifecycle;
use crate::publisher::StatePublisher;
use crate::records::DesiredPlacement;
use crate::virt::VirtDriver;
use crate::volume::VolumeDriver;

/// Counters for one reconciliation tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub claims_won: usize,
    pub claims_lost: usize,
    pub instances_created: usize,
    pub create_failures: usize,
    pub instances_destroyed: usize,
    pub destroy_failures: usize,
    pub claims_refreshed: usize,
}

/// Reconciler for converging host state.
pub struct Reconciler {
    host_id: String,
    tick_interval: Duration,
    store: Arc<dyn CoordStore>,
    heartbeat: Heartbeat,
    claims: ClaimManager,
    lifecycle: InstanceLifecycle,
    publisher: StatePublisher,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        config: &Config,
        store: Arc<dyn CoordStore>,
        virt: Arc<dyn VirtDriver>,
        volumes: Arc<dyn VolumeDriver>,
    ) -> Self {
        let claim_ttl = Duration::from_secs(config.claim_ttl_secs);
        Self {
            host_id: config.host_id.clone(),
            tick_interval: Duration::from_secs(config.tick_interval_secs),
            heartbeat: Heartbeat::new(config, Arc::clone(&store)),
            claims: ClaimManager::new(Arc::clone(&store), &config.host_id, claim_ttl),
            lifecycle: InstanceLifecycle::new(virt, volumes, config.source_image.clone()),
            publisher: StatePublisher::new(Arc::clone(&store), &config.host_id, claim_ttl),
            store,
        }
    }

    /// Number of instances this host currently runs.
    pub fn instance_count(&self) -> usize {
        self.lifecycle.len()
    }

    /// Run the reconciliation loop until shutdown.
    ///
    /// Local instances are torn down on the way out, both on a clean
    /// shutdown and on an unrecoverable error, so a stopping agent never
    /// leaves guests running behind claims that are about to lapse.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            host_id = %self.host_id,
            tick_interval_secs = self.tick_interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(stats) => {
                            debug!(
                                claims_won = stats.claims_won,
                                instances_created = stats.instances_created,
                                instances_destroyed = stats.instances_destroyed,
                                claims_refreshed = stats.claims_refreshed,
                                "Tick complete"
                            );
                        }
                        Err(e) if e.is_transient() => {
                            warn!(error = %e, "Tick failed, will retry");
                        }
                        Err(e) => {
                            error!(error = %e, "Unrecoverable store error");
                            self.lifecycle.destroy_all().await;
                            return Err(e.into());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }

        self.lifecycle.destroy_all().await;
        Ok(())
    }

    /// Perform a single reconciliation tick.
    pub async fn tick(&mut self) -> Result<ReconcileStats, CoordError> {
        let mut stats = ReconcileStats::default();

        self.heartbeat.publish(&self.lifecycle.usage()).await?;
        self.reconcile(&mut stats).await?;
        stats.claims_refreshed = self.publisher.publish(self.lifecycle.instances()).await?;

        Ok(stats)
    }

    async fn reconcile(&mut self, stats: &mut ReconcileStats) -> Result<(), CoordError> {
        let desired = self.store.list_children(keys::DESIRED_DIR).await?;
        let claimed = self.store.list_children(keys::CLAIMED_DIR).await?;

        // Race claims for placements nobody holds yet.
        for (placement_id, raw) in &desired {
            if claimed.contains_key(placement_id) || self.lifecycle.owns(placement_id) {
                continue;
            }

            let placement: DesiredPlacement = match serde_json::from_str(raw) {
                Ok(placement) => placement,
                Err(e) => {
                    warn!(
                        placement_id = %placement_id,
                        error = %e,
                        "Skipping malformed placement request"
                    );
                    continue;
                }
            };

            match self.claims.try_claim(placement_id).await? {
                ClaimOutcome::Claimed => {
                    stats.claims_won += 1;
                    info!(
                        placement_id = %placement_id,
                        name = %placement.name,
                        "Won claim"
                    );
                    match self.lifecycle.create(placement_id, &placement).await {
                        Ok(()) => stats.instances_created += 1,
                        Err(e) => {
                            // The claim is held until its lease lapses, so
                            // other hosts will not pile onto a placement
                            // this host just failed to realize.
                            stats.create_failures += 1;
                            error!(
                                placement_id = %placement_id,
                                error = %e,
                                "Failed to realize placement"
                            );
                        }
                    }
                }
                ClaimOutcome::Lost { .. } => {
                    stats.claims_lost += 1;
                }
            }
        }

        // Tear down instances whose placement left the desired set. Keyed
        // on raw desired keys, so a placement whose value no longer parses
        // still holds its instance.
        for placement_id in self.lifecycle.placement_ids() {
            if desired.contains_key(&placement_id) {
                continue;
            }

            info!(
                placement_id = %placement_id,
                "Placement left desired set, tearing down"
            );
            match self.lifecycle.destroy(&placement_id).await {
                Ok(()) => stats.instances_destroyed += 1,
                Err(e) => {
                    stats.destroy_failures += 1;
                    warn!(placement_id = %placement_id, error = %e, "Teardown incomplete");
                }
            }
        }

        Ok(())
    }
}
