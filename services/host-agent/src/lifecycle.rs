//! Local instance lifecycle: realizing claimed placements on this host.
//!
//! The lifecycle tracks every instance this agent has started, keyed by
//! placement id. Realizing a placement is a two-step build (clone the boot
//! volume, then define and start the domain); teardown runs the steps in
//! reverse and is best effort, since a half-dead instance should never
//! wedge the reconcile loop.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::definition::build_definition;
use crate::records::{DesiredPlacement, ResourceRequest};
use crate::resources::ResourceUsage;
use crate::virt::{VirtDriver, VirtError};
use crate::volume::{VolumeDriver, VolumeError};

/// An instance this host runs.
#[derive(Debug, Clone)]
pub struct LocalInstance {
    /// Placement this instance realizes.
    pub placement_id: String,

    /// Domain handle in the hypervisor.
    pub instance: String,

    /// Boot volume handle.
    pub volume: String,

    /// Requested shape, counted into the host's usage.
    pub resources: ResourceRequest,
}

/// Errors from realizing or tearing down a placement.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("volume creation failed for {placement_id}: {source}")]
    Volume {
        placement_id: String,
        source: VolumeError,
    },

    #[error("instance start failed for {placement_id}: {source}")]
    Start {
        placement_id: String,
        source: VirtError,
    },

    #[error("teardown of {placement_id} incomplete: {detail}")]
    Teardown {
        placement_id: String,
        detail: String,
    },
}

/// Tracks and drives instances local to this host.
pub struct InstanceLifecycle {
    virt: Arc<dyn VirtDriver>,
    volumes: Arc<dyn VolumeDriver>,

    /// Image cloned when a placement does not name one.
    default_source_image: String,

    /// Running instances by placement id.
    instances: HashMap<String, LocalInstance>,
}

impl InstanceLifecycle {
    pub fn new(
        virt: Arc<dyn VirtDriver>,
        volumes: Arc<dyn VolumeDriver>,
        default_source_image: String,
    ) -> Self {
        Self {
            virt,
            volumes,
            default_source_image,
            instances: HashMap::new(),
        }
    }

    /// Whether this host runs an instance for the placement.
    pub fn owns(&self, placement_id: &str) -> bool {
        self.instances.contains_key(placement_id)
    }

    /// Placement ids of every local instance.
    pub fn placement_ids(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    /// Every local instance.
    pub fn instances(&self) -> impl Iterator<Item = &LocalInstance> {
        self.instances.values()
    }

    /// Number of local instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Resources committed to local instances.
    pub fn usage(&self) -> ResourceUsage {
        let mut usage = ResourceUsage::default();
        for instance in self.instances.values() {
            usage.add(&instance.resources);
        }
        usage
    }

    /// Realize a claimed placement: clone its boot volume, then define and
    /// start the domain.
    pub async fn create(
        &mut self,
        placement_id: &str,
        placement: &DesiredPlacement,
    ) -> Result<(), LifecycleError> {
        let volume_name = format!("vm-{placement_id}-0");
        let source_image = placement
            .source_image
            .as_deref()
            .unwrap_or(&self.default_source_image);

        let volume = self
            .volumes
            .create(&volume_name, source_image)
            .await
            .map_err(|source| LifecycleError::Volume {
                placement_id: placement_id.to_string(),
                source,
            })?;

        let definition = build_definition(placement_id, placement, Uuid::new_v4(), &volume);
        let instance = match self.virt.define_and_start(&definition).await {
            Ok(handle) => handle,
            Err(source) => {
                // The cloned volume stays behind; the claim lapses on its
                // own and whichever host retakes it rebuilds the volume.
                warn!(
                    placement_id = %placement_id,
                    volume = %volume,
                    "Instance start failed, volume left in place"
                );
                return Err(LifecycleError::Start {
                    placement_id: placement_id.to_string(),
                    source,
                });
            }
        };

        info!(
            placement_id = %placement_id,
            instance = %instance,
            ram_mib = placement.resources.ram_mib,
            vcpus = placement.resources.vcpus,
            "Instance running"
        );

        self.instances.insert(
            placement_id.to_string(),
            LocalInstance {
                placement_id: placement_id.to_string(),
                instance,
                volume,
                resources: placement.resources,
            },
        );
        Ok(())
    }

    /// Tear down the instance realizing a placement: stop and undefine the
    /// domain, then delete its boot volume.
    ///
    /// The entry is dropped up front; teardown failures are reported but
    /// not retried.
    pub async fn destroy(&mut self, placement_id: &str) -> Result<(), LifecycleError> {
        let Some(instance) = self.instances.remove(placement_id) else {
            return Ok(());
        };

        let mut failures = Vec::new();
        if let Err(e) = self.virt.stop(&instance.instance).await {
            failures.push(format!("stop: {e}"));
        }
        if let Err(e) = self.virt.undefine(&instance.instance).await {
            failures.push(format!("undefine: {e}"));
        }
        if let Err(e) = self.volumes.delete(&instance.volume).await {
            failures.push(format!("volume: {e}"));
        }

        if failures.is_empty() {
            info!(
                placement_id = %placement_id,
                instance = %instance.instance,
                "Instance torn down"
            );
            Ok(())
        } else {
            Err(LifecycleError::Teardown {
                placement_id: placement_id.to_string(),
                detail: failures.join("; "),
            })
        }
    }

    /// Tear down every local instance. Used on shutdown, when leaving
    /// instances running would strand them behind a lapsed claim.
    pub async fn destroy_all(&mut self) {
        if self.instances.is_empty() {
            return;
        }

        info!(count = self.instances.len(), "Tearing down all local instances");
        for placement_id in self.placement_ids() {
            if let Err(e) = self.destroy(&placement_id).await {
                warn!(error = %e, "Teardown incomplete");
            }
        }
    }
}
