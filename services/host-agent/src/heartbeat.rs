//! Host presence publication.
//!
//! Each tick the agent rewrites its host record with a short lease. The
//! record advertises capacity and committed usage so operators and external
//! schedulers can see the live fleet; a host that dies simply ages out of
//! the hosts directory when its lease lapses.

use std::sync::Arc;
use std::time::Duration;

use corral_coord::{CoordError, CoordStore};
use tracing::debug;

use crate::config::Config;
use crate::keys;
use crate::records::HostRecord;
use crate::resources::ResourceUsage;

/// Publishes this host's presence record.
pub struct Heartbeat {
    store: Arc<dyn CoordStore>,
    host_id: String,
    total_ram_mib: u64,
    total_vcpu: u32,
    host_ttl: Duration,
}

impl Heartbeat {
    pub fn new(config: &Config, store: Arc<dyn CoordStore>) -> Self {
        Self {
            store,
            host_id: config.host_id.clone(),
            total_ram_mib: config.total_ram_mib,
            total_vcpu: config.total_vcpu,
            host_ttl: Duration::from_secs(config.host_ttl_secs),
        }
    }

    /// Write the host record with a fresh lease.
    pub async fn publish(&self, usage: &ResourceUsage) -> Result<(), CoordError> {
        let record = HostRecord {
            name: self.host_id.clone(),
            total_ram: self.total_ram_mib,
            used_ram: usage.ram_mib,
            total_vcpu: self.total_vcpu,
            used_vcpu: usage.vcpus,
        };
        let value = serde_json::to_string(&record)?;

        self.store
            .write(&keys::host(&self.host_id), &value, Some(self.host_ttl))
            .await?;

        debug!(
            host_id = %self.host_id,
            used_ram_mib = usage.ram_mib,
            used_vcpu = usage.vcpus,
            "Heartbeat published"
        );
        Ok(())
    }
}
