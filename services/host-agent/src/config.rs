//! Configuration for the host agent.

use anyhow::Result;

use crate::resources::SystemResources;

/// Host agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier for this host. Defaults to the kernel hostname.
    pub host_id: String,

    /// Coordination store endpoint URL.
    pub store_url: String,

    /// Data directory for rendered domain definitions.
    pub data_dir: String,

    /// Interval between reconciliation ticks, in seconds. Clamped to at
    /// least one second.
    pub tick_interval_secs: u64,

    /// Lease applied to claim records, in seconds. Must exceed the tick
    /// interval or claims lapse between refreshes.
    pub claim_ttl_secs: u64,

    /// Lease applied to the host presence record, in seconds.
    pub host_ttl_secs: u64,

    /// Advertised RAM capacity in MiB.
    pub total_ram_mib: u64,

    /// Advertised vCPU capacity.
    pub total_vcpu: u32,

    /// Default image to clone boot volumes from when a placement does not
    /// name one.
    pub source_image: String,

    /// Storage pool boot volumes are created in.
    pub volume_pool: String,

    /// Use in-process mock drivers instead of virsh/rbd. For development
    /// hosts without a hypervisor.
    pub mock_drivers: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let host_id = std::env::var("CORRAL_HOST_ID").unwrap_or_else(|_| default_host_id());

        let store_url = std::env::var("CORRAL_STORE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:2379".to_string());

        let data_dir =
            std::env::var("CORRAL_DATA_DIR").unwrap_or_else(|_| "/var/lib/corral".to_string());

        // tokio's interval rejects a zero period.
        let tick_interval_secs = std::env::var("CORRAL_TICK_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2)
            .max(1);

        let claim_ttl_secs = std::env::var("CORRAL_CLAIM_TTL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let host_ttl_secs = std::env::var("CORRAL_HOST_TTL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        // Capacity can be pinned down for heterogeneous fleets; otherwise
        // it is detected from the host.
        let detected = SystemResources::detect();
        let total_ram_mib = std::env::var("CORRAL_TOTAL_RAM_MIB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(detected.total_ram_mib);
        let total_vcpu = std::env::var("CORRAL_TOTAL_VCPU")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(detected.total_vcpu);

        let source_image = std::env::var("CORRAL_SOURCE_IMAGE")
            .unwrap_or_else(|_| "images/cirros-0.3.3-x86_64-disk.raw".to_string());

        let volume_pool =
            std::env::var("CORRAL_VOLUME_POOL").unwrap_or_else(|_| "volumes".to_string());

        let mock_drivers = std::env::var("CORRAL_MOCK_DRIVERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);

        Ok(Self {
            host_id,
            store_url,
            data_dir,
            tick_interval_secs,
            claim_ttl_secs,
            host_ttl_secs,
            total_ram_mib,
            total_vcpu,
            source_image,
            volume_pool,
            mock_drivers,
        })
    }
}

fn default_host_id() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }

    std::env::var("HOSTNAME").unwrap_or_else(|_| "corral-host".to_string())
}
