//! Corral host agent.
//!
//! The host agent runs on each hypervisor host and converges it with the
//! fleet's desired state. It claims placements from a shared coordination
//! store, boots them as local VMs, and advertises the host's capacity, all
//! from a single reconciliation loop.

use std::sync::Arc;

use anyhow::Result;
use corral_coord::{CoordStore, EtcdStore};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use corral_host_agent::config::Config;
use corral_host_agent::reconciler::Reconciler;
use corral_host_agent::virt::{MockVirt, VirshDriver, VirtDriver};
use corral_host_agent::volume::{MockVolumes, RbdDriver, VolumeDriver};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting corral host agent");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        host_id = %config.host_id,
        store_url = %config.store_url,
        total_ram_mib = config.total_ram_mib,
        total_vcpu = config.total_vcpu,
        mock_drivers = config.mock_drivers,
        "Configuration loaded"
    );

    let store: Arc<dyn CoordStore> = Arc::new(EtcdStore::new(&config.store_url));

    let (virt, volumes): (Arc<dyn VirtDriver>, Arc<dyn VolumeDriver>) = if config.mock_drivers {
        (Arc::new(MockVirt::new()), Arc::new(MockVolumes::new()))
    } else {
        (
            Arc::new(VirshDriver::new(&config.data_dir)),
            Arc::new(RbdDriver::new(&config.volume_pool)),
        )
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the reconciliation loop
    let reconciler = Reconciler::new(&config, store, virt, volumes);
    let mut reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut reconciler_handle => {
            return match result {
                Ok(Ok(())) => {
                    info!("Reconciler exited");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Reconciler failed");
                    Err(e)
                }
                Err(e) => {
                    error!(error = %e, "Reconciler task panicked");
                    Err(e.into())
                }
            };
        }
    }

    // Signal shutdown and wait for the loop to tear down local instances
    let _ = shutdown_tx.send(true);
    match reconciler_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Reconciler failed during shutdown"),
        Err(e) => error!(error = %e, "Reconciler task panicked"),
    }

    info!("Host agent shutdown complete");
    Ok(())
}
