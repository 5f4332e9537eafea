//! Claim racing over the coordination store.
//!
//! Every agent that sees an unclaimed placement races to create the claim
//! key. The store's conditional create admits exactly one winner; everyone
//! else observes a lost race, which is an ordinary outcome rather than an
//! error. A claim is held by lease and lapses on its own if the owner stops
//! refreshing it.

use std::sync::Arc;
use std::time::Duration;

use corral_coord::{CoordError, CoordStore, CreateOutcome};
use tracing::{debug, info};

use crate::keys;
use crate::records::ClaimRecord;

/// Outcome of racing for a placement.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This host won the race and owns the placement for the lease window.
    Claimed,
    /// Another host holds the claim.
    Lost {
        /// The winning claim, when it could be read back.
        winner: Option<ClaimRecord>,
    },
}

/// Races claims on behalf of one host.
pub struct ClaimManager {
    store: Arc<dyn CoordStore>,
    host_id: String,
    claim_ttl: Duration,
}

impl ClaimManager {
    pub fn new(store: Arc<dyn CoordStore>, host_id: &str, claim_ttl: Duration) -> Self {
        Self {
            store,
            host_id: host_id.to_string(),
            claim_ttl,
        }
    }

    /// Try to claim a placement for this host.
    pub async fn try_claim(&self, placement_id: &str) -> Result<ClaimOutcome, CoordError> {
        let key = keys::claimed(placement_id);
        let record = ClaimRecord::starting(&self.host_id);
        let value = serde_json::to_string(&record)?;

        match self
            .store
            .create_if_absent(&key, &value, self.claim_ttl)
            .await?
        {
            CreateOutcome::Created => {
                debug!(placement_id = %placement_id, "Claim created");
                Ok(ClaimOutcome::Claimed)
            }
            CreateOutcome::AlreadyExists => {
                // Reading the winner back is best effort; the claim may
                // already have lapsed again by the time we look.
                let winner = self
                    .store
                    .read(&key)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|value| serde_json::from_str(&value).ok());

                if let Some(ClaimRecord { ref host, .. }) = winner {
                    info!(placement_id = %placement_id, winner = %host, "Lost claim race");
                } else {
                    info!(placement_id = %placement_id, "Lost claim race");
                }
                Ok(ClaimOutcome::Lost { winner })
            }
        }
    }
}
