//! Coordination-store contract for the corral platform.
//!
//! Every host agent coordinates through a shared, lease-based key-value
//! store. This library defines the small contract the agents consume and the
//! two clients that satisfy it:
//!
//! - [`EtcdStore`]: the production client, speaking the etcd v2 keys API
//!   over HTTP.
//! - [`MemoryStore`]: a shareable in-process store with the same lease
//!   semantics, used for tests and simulated multi-host fleets.
//!
//! # Invariants
//!
//! - [`CoordStore::create_if_absent`] is atomic: of any number of concurrent
//!   calls for the same key, exactly one observes [`CreateOutcome::Created`].
//!   It is the only cross-host ordering primitive in the platform.
//! - An entry written with a lease disappears once the lease elapses without
//!   a refreshing write. Expiry is the sole ownership-release mechanism;
//!   there is no delete operation in the contract.
//! - Reads and listings are point-in-time snapshots with no freshness
//!   guarantee; callers are expected to re-read on their next pass.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

mod error;
mod etcd;
mod memory;

pub use error::CoordError;
pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Outcome of a conditional create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The key did not exist and was created; the caller owns it for the
    /// lease window.
    Created,
    /// Another writer created the key first.
    AlreadyExists,
}

impl CreateOutcome {
    /// Returns true if this caller's create won.
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created)
    }
}

/// Contract over the shared lease-based key-value store.
///
/// Keys are slash-separated paths (`/fleet/hosts/h1`); values are opaque
/// strings (the agents store JSON records).
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Read a single key. Returns `None` if the key does not exist or its
    /// lease has expired.
    async fn read(&self, key: &str) -> Result<Option<String>, CoordError>;

    /// Unconditionally upsert a key, with an optional lease. Writing over a
    /// leased entry replaces the lease. Leases have whole-second resolution.
    async fn write(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordError>;

    /// Atomically create a key only if it does not already exist (a live
    /// lease counts as existing). The created entry carries `ttl`.
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<CreateOutcome, CoordError>;

    /// List the direct children of a directory key, as a map from the short
    /// child key (final path segment) to its value. A directory that does
    /// not exist lists as an empty map.
    async fn list_children(&self, key: &str) -> Result<BTreeMap<String, String>, CoordError>;
}
