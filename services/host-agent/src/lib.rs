//! Corral host agent library.
//!
//! The host agent runs on every hypervisor host in a corral fleet. Hosts
//! share nothing but a lease-based coordination store: placement requests
//! appear in a desired directory, and every agent races to claim each one.
//! The winner clones a boot volume, starts a VM, and keeps refreshing its
//! leased claim; if it dies, the claim lapses and another host takes over.
//!
//! ## Architecture
//!
//! One cooperative loop drives everything, a tick at a time:
//!
//! - **Heartbeat**: publishes this host's capacity and usage with a lease
//! - **ClaimManager**: races atomic claim creates against other hosts
//! - **InstanceLifecycle**: realizes won placements as local VMs and tears
//!   them down when their placement disappears
//! - **StatePublisher**: refreshes claim leases for running instances
//!
//! There is no cross-host RPC and no leader: the claim race over the store
//! is the only coordination primitive in the platform.

pub mod claim;
pub mod config;
pub mod definition;
pub mod heartbeat;
pub mod keys;
pub mod lifecycle;
pub mod publisher;
pub mod reconciler;
pub mod records;
pub mod resources;
pub mod virt;
pub mod volume;

// Re-export commonly used types
pub use claim::{ClaimManager, ClaimOutcome};
pub use config::Config;
pub use lifecycle::{InstanceLifecycle, LocalInstance};
pub use reconciler::{ReconcileStats, Reconciler};
pub use records::{ClaimRecord, ClaimState, DesiredPlacement, HostRecord, ResourceRequest};
pub use virt::{MockVirt, VirshDriver, VirtDriver};
pub use volume::{MockVolumes, RbdDriver, VolumeDriver};
