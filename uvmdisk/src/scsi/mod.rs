//! SCSI hot-attach of host disk images to a running guest.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uvmdisk_shared::errors::{DiskError, DiskResult};

use crate::runtime::constants::guest_paths;

/// Where an attached disk appears on the guest's SCSI bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScsiAddress {
    pub controller: u8,
    pub lun: u8,
}

impl ScsiAddress {
    pub fn new(controller: u8, lun: u8) -> Self {
        Self { controller, lun }
    }

    /// Guest sysfs directory for this device: `/sys/bus/scsi/devices/{c}:0:0:{l}`.
    pub fn sysfs_path(&self) -> String {
        format!(
            "{}/{}:0:0:{}",
            guest_paths::SCSI_DEVICES,
            self.controller,
            self.lun
        )
    }

    /// Directory whose single entry names the block device.
    pub fn block_path(&self) -> String {
        format!("{}/block", self.sysfs_path())
    }
}

impl fmt::Display for ScsiAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.controller, self.lun)
    }
}

/// Guest device node for a name listed under the sysfs `block` directory.
pub fn device_path(listing: &str) -> DiskResult<String> {
    let name = listing.trim();
    if name.is_empty() || name.contains('/') || name.contains(char::is_whitespace) {
        return Err(DiskError::GuestCommand {
            command: "ls".to_string(),
            exit_code: 0,
            stderr: format!("unexpected block device listing {:?}", listing),
        });
    }
    Ok(format!("{}/{}", guest_paths::DEV, name))
}

/// Hot-adds and hot-removes disk images on a running guest.
#[async_trait]
pub trait DeviceAttacher: Send + Sync {
    /// Attach the disk at `path`. Fails with [`DiskError::Attach`] when the
    /// guest or the virtualization layer rejects it.
    async fn attach(&self, path: &Path) -> DiskResult<ScsiAddress>;

    /// Detach a disk attached at `address`.
    async fn detach(&self, path: &Path, address: ScsiAddress) -> DiskResult<()>;
}

/// A live attachment that must be detached exactly once.
///
/// Both [`ScsiAttachment::detach`] and [`ScsiAttachment::rollback`] consume
/// the guard.
#[must_use = "an attachment must be detached"]
pub struct ScsiAttachment<'a> {
    attacher: &'a dyn DeviceAttacher,
    path: PathBuf,
    address: ScsiAddress,
}

impl<'a> ScsiAttachment<'a> {
    /// Hot-add `path` through `attacher`.
    pub async fn attach(attacher: &'a dyn DeviceAttacher, path: &Path) -> DiskResult<Self> {
        let address = attacher.attach(path).await?;
        tracing::debug!(
            path = %path.display(),
            controller = address.controller,
            lun = address.lun,
            "Attached disk"
        );
        Ok(Self {
            attacher,
            path: path.to_path_buf(),
            address,
        })
    }

    pub fn address(&self) -> ScsiAddress {
        self.address
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detach. A failure here is returned as [`DiskError::Detach`].
    pub async fn detach(self) -> DiskResult<()> {
        self.attacher
            .detach(&self.path, self.address)
            .await
            .map_err(|e| match e {
                DiskError::Detach(msg) => DiskError::Detach(msg),
                other => DiskError::Detach(format!(
                    "failed to detach {} at {}: {}",
                    self.path.display(),
                    self.address,
                    other
                )),
            })?;
        tracing::debug!(
            path = %self.path.display(),
            controller = self.address.controller,
            lun = self.address.lun,
            "Detached disk"
        );
        Ok(())
    }

    /// Best-effort detach on an error path. Returns `primary` unchanged; a
    /// detach failure is only logged.
    pub async fn rollback(self, primary: DiskError) -> DiskError {
        let path = self.path.clone();
        let address = self.address;
        if let Err(e) = self.detach().await {
            tracing::warn!(
                path = %path.display(),
                controller = address.controller,
                lun = address.lun,
                error = %e,
                "Failed to detach disk after error"
            );
        }
        primary
    }
}
