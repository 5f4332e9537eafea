//! Hypervisor driver for defining and running instances.
//!
//! The driver interface abstracts domain lifecycle operations:
//! - Defining and starting a domain from a rendered definition
//! - Forcing a domain off and removing its definition
//!
//! The production driver shells out to `virsh`; a mock implementation is
//! provided for tests and for development hosts without a hypervisor.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::definition::DomainDefinition;

/// Errors from domain lifecycle operations.
#[derive(Debug, Error)]
pub enum VirtError {
    #[error("failed to write domain definition: {0}")]
    WriteFailed(String),

    #[error("failed to define domain: {0}")]
    DefineFailed(String),

    #[error("failed to start domain: {0}")]
    StartFailed(String),

    #[error("failed to stop domain: {0}")]
    StopFailed(String),

    #[error("failed to undefine domain: {0}")]
    UndefineFailed(String),
}

/// Domain lifecycle interface.
#[async_trait]
pub trait VirtDriver: Send + Sync {
    /// Define a domain from the given definition and start it. Returns the
    /// domain name as the instance handle.
    async fn define_and_start(&self, definition: &DomainDefinition) -> Result<String, VirtError>;

    /// Force a running domain off. Errors if the domain is not running.
    async fn stop(&self, instance: &str) -> Result<(), VirtError>;

    /// Remove a domain definition from the hypervisor.
    async fn undefine(&self, instance: &str) -> Result<(), VirtError>;
}

/// Production driver shelling out to `virsh`.
pub struct VirshDriver {
    /// Directory rendered definitions are written into before `virsh define`.
    data_dir: PathBuf,
}

impl VirshDriver {
    pub fn new(data_dir: &str) -> Self {
        Self {
            data_dir: PathBuf::from(data_dir),
        }
    }

    fn definition_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.xml"))
    }

    /// Render the definition to disk so `virsh define` can read it and an
    /// operator can inspect what was actually defined.
    async fn write_definition(&self, definition: &DomainDefinition) -> Result<PathBuf, VirtError> {
        let path = self.definition_path(&definition.name);
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| VirtError::WriteFailed(e.to_string()))?;
        tokio::fs::write(&path, definition.render())
            .await
            .map_err(|e| VirtError::WriteFailed(e.to_string()))?;

        debug!(path = %path.display(), "Wrote domain definition");
        Ok(path)
    }
}

#[async_trait]
impl VirtDriver for VirshDriver {
    async fn define_and_start(&self, definition: &DomainDefinition) -> Result<String, VirtError> {
        let path = self.write_definition(definition).await?;

        run_virsh(&["define", &path.display().to_string()])
            .await
            .map_err(|e| VirtError::DefineFailed(e.to_string()))?;

        run_virsh(&["start", &definition.name])
            .await
            .map_err(|e| VirtError::StartFailed(e.to_string()))?;

        info!(instance = %definition.name, "Domain defined and started");
        Ok(definition.name.clone())
    }

    async fn stop(&self, instance: &str) -> Result<(), VirtError> {
        run_virsh(&["destroy", instance])
            .await
            .map_err(|e| VirtError::StopFailed(e.to_string()))
    }

    async fn undefine(&self, instance: &str) -> Result<(), VirtError> {
        run_virsh(&["undefine", instance])
            .await
            .map_err(|e| VirtError::UndefineFailed(e.to_string()))?;

        // The rendered definition is only useful while the domain exists.
        let _ = tokio::fs::remove_file(self.definition_path(instance)).await;
        Ok(())
    }
}

/// Run a `virsh` command and return result.
async fn run_virsh(args: &[&str]) -> Result<()> {
    let output = Command::new("virsh")
        .args(args)
        .output()
        .await
        .context("failed to execute virsh")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("virsh {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(())
}

/// Mock driver for tests and development.
#[derive(Default)]
pub struct MockVirt {
    started: Mutex<Vec<DomainDefinition>>,
    stopped: Mutex<Vec<String>>,
    undefined: Mutex<Vec<String>>,

    /// Whether domains should "fail" to start.
    fail_starts: bool,
}

impl MockVirt {
    /// Create a new mock driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock driver that fails all starts.
    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            ..Self::default()
        }
    }

    /// Definitions of every domain started so far.
    pub async fn started(&self) -> Vec<DomainDefinition> {
        self.started.lock().await.clone()
    }

    /// Names of every domain stopped so far.
    pub async fn stopped(&self) -> Vec<String> {
        self.stopped.lock().await.clone()
    }

    /// Names of every domain undefined so far.
    pub async fn undefined(&self) -> Vec<String> {
        self.undefined.lock().await.clone()
    }
}

#[async_trait]
impl VirtDriver for MockVirt {
    async fn define_and_start(&self, definition: &DomainDefinition) -> Result<String, VirtError> {
        if self.fail_starts {
            return Err(VirtError::StartFailed("mock driver configured to fail".into()));
        }

        info!(instance = %definition.name, "[MOCK] Domain started");
        self.started.lock().await.push(definition.clone());
        Ok(definition.name.clone())
    }

    async fn stop(&self, instance: &str) -> Result<(), VirtError> {
        debug!(instance = %instance, "[MOCK] Domain stopped");
        self.stopped.lock().await.push(instance.to_string());
        Ok(())
    }

    async fn undefine(&self, instance: &str) -> Result<(), VirtError> {
        debug!(instance = %instance, "[MOCK] Domain undefined");
        self.undefined.lock().await.push(instance.to_string());
        Ok(())
    }
}
