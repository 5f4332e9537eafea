//! Wire records exchanged through the coordination store.
//!
//! Every value is a small JSON document. Records are read by other agents
//! and by operators inspecting the store, so field names are part of the
//! platform contract and must stay stable.

use serde::{Deserialize, Serialize};

/// Host presence record, published under `/fleet/hosts/{host_id}` with a
/// lease. A host that stops heartbeating disappears from the fleet view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Host identifier, duplicated into the value for listing convenience.
    pub name: String,

    /// Total RAM capacity in MiB.
    pub total_ram: u64,

    /// RAM committed to instances this host runs, in MiB.
    pub used_ram: u64,

    /// Total vCPU capacity.
    pub total_vcpu: u32,

    /// vCPUs committed to instances this host runs.
    pub used_vcpu: u32,
}

/// A placement request, read from `/fleet/desired/{placement_id}`.
///
/// The short key under the desired directory is the placement id; the value
/// carries the requested shape. Absent fields fall back to platform
/// defaults so a bare `{"name": "web-1"}` is a valid request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredPlacement {
    /// Requested instance name.
    pub name: String,

    /// Requested instance shape.
    #[serde(default)]
    pub resources: ResourceRequest,

    /// Image to clone the boot volume from. Falls back to the agent's
    /// configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
}

/// Requested instance shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Guest RAM in MiB.
    pub ram_mib: u64,

    /// Guest vCPU count.
    pub vcpus: u32,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            ram_mib: 1024,
            vcpus: 1,
        }
    }
}

/// Claim record, written under `/fleet/claimed/{placement_id}` with a lease.
///
/// The initial claim is written atomically during the race; the owning agent
/// then rewrites the record every tick to keep the lease alive, filling in
/// the instance handle once the placement is realized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    /// Host that owns the claim.
    pub host: String,

    /// Claim state.
    pub state: ClaimState,

    /// Handle of the locally running instance, once started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ClaimRecord {
    /// The record an agent writes when racing for a placement.
    pub fn starting(host: &str) -> Self {
        Self {
            host: host.to_string(),
            state: ClaimState::Starting,
            instance: None,
        }
    }

    /// The record an agent republishes for an instance it runs.
    pub fn running(host: &str, instance: &str) -> Self {
        Self {
            host: host.to_string(),
            state: ClaimState::Starting,
            instance: Some(instance.to_string()),
        }
    }
}

/// Claim lifecycle state on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    /// Claimed by a host; the instance is being or has been started.
    Starting,
}
