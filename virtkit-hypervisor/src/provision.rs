//! Template image provisioning: copy a source image into place and seed it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};

/// Copies template images and seeds them with initial configuration.
#[async_trait]
pub trait ImageProvisioner: Send + Sync {
    /// Copy `source` to `dest`, creating the parent directory.
    async fn copy_template(&self, source: &Path, dest: &Path) -> Result<()>;

    /// Inject initial configuration into the image of `vm_name`.
    async fn seed(&self, image: &Path, vm_name: &str, install: bool) -> Result<()>;

    /// Whether seeding is configured at all.
    fn can_seed(&self) -> bool;
}

/// Local filesystem provisioner running an external seed command.
///
/// The seed command is invoked as `<command> <image> <vm-name> [--install]`.
#[derive(Debug, Clone, Default)]
pub struct LocalProvisioner {
    seed_command: Option<PathBuf>,
}

impl LocalProvisioner {
    pub fn new(seed_command: Option<PathBuf>) -> Self {
        Self { seed_command }
    }
}

#[async_trait]
impl ImageProvisioner for LocalProvisioner {
    #[instrument(skip(self), fields(source = %source.display(), dest = %dest.display()))]
    async fn copy_template(&self, source: &Path, dest: &Path) -> Result<()> {
        if !fs::try_exists(source).await.unwrap_or(false) {
            return Err(HypervisorError::OperationFailed(format!(
                "template image does not exist: {}",
                source.display()
            )));
        }

        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir).await?;
        }
        let bytes = fs::copy(source, dest).await?;

        info!(bytes, "Template image copied");
        Ok(())
    }

    #[instrument(skip(self), fields(image = %image.display()))]
    async fn seed(&self, image: &Path, vm_name: &str, install: bool) -> Result<()> {
        let command = self.seed_command.as_ref().ok_or_else(|| {
            HypervisorError::OperationFailed("no seed command configured".to_string())
        })?;

        let mut cmd = Command::new(command);
        cmd.arg(image).arg(vm_name);
        if install {
            cmd.arg("--install");
        }

        debug!(command = %command.display(), "Running seed command");
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HypervisorError::Internal(format!("Failed to execute seed command: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::OperationFailed(format!(
                "seed command failed: {}",
                stderr.trim()
            )));
        }

        info!("Image seeded");
        Ok(())
    }

    fn can_seed(&self) -> bool {
        self.seed_command.is_some()
    }
}
