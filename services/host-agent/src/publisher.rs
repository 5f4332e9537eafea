//! Claim refresh for instances this host runs.
//!
//! Claims are leased, so ownership must be re-asserted every tick. The
//! publisher rewrites the claim record for each local instance with a fresh
//! lease, filling in the instance handle so the claimed directory doubles
//! as a fleet-wide view of what runs where.

use std::sync::Arc;
use std::time::Duration;

use corral_coord::{CoordError, CoordStore};
use tracing::debug;

use crate::keys;
use crate::lifecycle::LocalInstance;
use crate::records::ClaimRecord;

/// Republishes claim records for one host.
pub struct StatePublisher {
    store: Arc<dyn CoordStore>,
    host_id: String,
    claim_ttl: Duration,
}

impl StatePublisher {
    pub fn new(store: Arc<dyn CoordStore>, host_id: &str, claim_ttl: Duration) -> Self {
        Self {
            store,
            host_id: host_id.to_string(),
            claim_ttl,
        }
    }

    /// Rewrite the claim for every given instance with a fresh lease.
    /// Returns the number of claims published.
    pub async fn publish<'a, I>(&self, instances: I) -> Result<usize, CoordError>
    where
        I: IntoIterator<Item = &'a LocalInstance>,
    {
        let mut published = 0;
        for instance in instances {
            let record = ClaimRecord::running(&self.host_id, &instance.instance);
            let value = serde_json::to_string(&record)?;

            self.store
                .write(
                    &keys::claimed(&instance.placement_id),
                    &value,
                    Some(self.claim_ttl),
                )
                .await?;

            debug!(
                placement_id = %instance.placement_id,
                instance = %instance.instance,
                "Claim refreshed"
            );
            published += 1;
        }
        Ok(published)
    }
}
