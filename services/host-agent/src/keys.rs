//! Key layout in the coordination store.
//!
//! All fleet state lives under three flat directories:
//!
//! - `/fleet/hosts/{host_id}`: leased host records, one per live agent
//! - `/fleet/desired/{placement_id}`: placement requests written by operators
//!   or an external scheduler
//! - `/fleet/claimed/{placement_id}`: leased claims written by the agent that
//!   won the placement

/// Directory of leased host records.
pub const HOSTS_DIR: &str = "/fleet/hosts";

/// Directory of placement requests.
pub const DESIRED_DIR: &str = "/fleet/desired";

/// Directory of leased claims.
pub const CLAIMED_DIR: &str = "/fleet/claimed";

/// Key for a host's presence record.
pub fn host(host_id: &str) -> String {
    format!("{HOSTS_DIR}/{host_id}")
}

/// Key for a placement request.
pub fn desired(placement_id: &str) -> String {
    format!("{DESIRED_DIR}/{placement_id}")
}

/// Key for a placement claim.
pub fn claimed(placement_id: &str) -> String {
    format!("{CLAIMED_DIR}/{placement_id}")
}
