//! Boot volume provisioning on shared storage.
//!
//! Each instance boots from a dedicated RBD volume cloned from a source
//! image. The production driver shells out to `qemu-img` for the clone and
//! `rbd` for deletion; a mock implementation records calls for tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Errors from volume operations.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("failed to create volume: {0}")]
    CreateFailed(String),

    #[error("failed to delete volume: {0}")]
    DeleteFailed(String),
}

/// Volume provisioning interface.
///
/// Handles returned by [`create`] are opaque to callers and passed back to
/// [`delete`] unchanged.
///
/// [`create`]: VolumeDriver::create
/// [`delete`]: VolumeDriver::delete
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Clone `source_image` into a new volume named `name`. Returns the
    /// volume handle.
    async fn create(&self, name: &str, source_image: &str) -> Result<String, VolumeError>;

    /// Delete a volume by handle.
    async fn delete(&self, volume: &str) -> Result<(), VolumeError>;
}

/// Production driver cloning RBD volumes with `qemu-img` and `rbd`.
pub struct RbdDriver {
    /// Pool new volumes are created in.
    pool: String,
}

impl RbdDriver {
    pub fn new(pool: &str) -> Self {
        Self {
            pool: pool.to_string(),
        }
    }
}

#[async_trait]
impl VolumeDriver for RbdDriver {
    async fn create(&self, name: &str, source_image: &str) -> Result<String, VolumeError> {
        let target = format!("{}/{}", self.pool, name);

        run_command(
            "qemu-img",
            &[
                "convert",
                "-O",
                "raw",
                &format!("rbd:{source_image}"),
                &format!("rbd:{target}"),
            ],
        )
        .await
        .map_err(|e| VolumeError::CreateFailed(e.to_string()))?;

        info!(volume = %target, source = %source_image, "Volume cloned");
        Ok(target)
    }

    async fn delete(&self, volume: &str) -> Result<(), VolumeError> {
        run_command("rbd", &["rm", volume])
            .await
            .map_err(|e| VolumeError::DeleteFailed(e.to_string()))?;

        debug!(volume = %volume, "Volume deleted");
        Ok(())
    }
}

/// Run a storage command and return result.
async fn run_command(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to execute {program}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{} {} failed: {}", program, args.join(" "), stderr.trim());
    }

    Ok(())
}

/// Mock driver for tests and development.
#[derive(Default)]
pub struct MockVolumes {
    created: Mutex<Vec<(String, String)>>,
    deleted: Mutex<Vec<String>>,

    /// Whether volume creation should "fail".
    fail_creates: bool,
}

impl MockVolumes {
    /// Create a new mock driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock driver that fails all creates.
    pub fn failing() -> Self {
        Self {
            fail_creates: true,
            ..Self::default()
        }
    }

    /// `(name, source_image)` pairs for every volume created so far.
    pub async fn created(&self) -> Vec<(String, String)> {
        self.created.lock().await.clone()
    }

    /// Handles of every volume deleted so far.
    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }
}

#[async_trait]
impl VolumeDriver for MockVolumes {
    async fn create(&self, name: &str, source_image: &str) -> Result<String, VolumeError> {
        if self.fail_creates {
            return Err(VolumeError::CreateFailed(
                "mock driver configured to fail".into(),
            ));
        }

        debug!(volume = %name, source = %source_image, "[MOCK] Volume cloned");
        self.created
            .lock()
            .await
            .push((name.to_string(), source_image.to_string()));
        Ok(format!("mock/{name}"))
    }

    async fn delete(&self, volume: &str) -> Result<(), VolumeError> {
        debug!(volume = %volume, "[MOCK] Volume deleted");
        self.deleted.lock().await.push(volume.to_string());
        Ok(())
    }
}
