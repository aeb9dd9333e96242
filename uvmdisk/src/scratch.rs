//! Scratch disk provisioning.
//!
//! [`ScratchFormatter::provision`] produces a formatted ext4 scratch disk at
//! a host path: served from the cache when possible, otherwise created,
//! hot-added to the utility VM, formatted from inside the guest, hot-removed
//! and used to seed the cache.
//!
//! Every failure after the attach detaches before returning, except when the
//! detach itself fails. A failed attach leaves the created file on disk for
//! the caller to remove.

use std::path::{Path, PathBuf};
use std::time::Duration;

use uvmdisk_shared::errors::{DiskError, DiskResult};

use crate::guest::{CaptureBuffer, GuestCapabilities, GuestCommandRunner, UtilityVm};
use crate::runtime::options::{DiskOptions, UvmDiskOptions};
use crate::scsi::{ScsiAddress, ScsiAttachment, device_path};
use crate::volumes::{DiskProvisioner, Ext4Format};

/// Where a provisioned disk came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScratchSource {
    /// Copied from the cache; the guest was not involved.
    FromCache,
    /// Created and formatted through the guest.
    Formatted {
        address: ScsiAddress,
        device: String,
    },
}

/// A scratch disk ready for use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Provisioned {
    pub path: PathBuf,
    /// Capacity after clamping to the floor.
    pub size_gb: u32,
    pub source: ScratchSource,
    pub cache_seeded: bool,
}

/// Creates and formats scratch disks.
#[derive(Clone)]
pub struct ScratchFormatter {
    provisioner: DiskProvisioner,
    runner: GuestCommandRunner,
    disk: DiskOptions,
    format: Ext4Format,
}

impl ScratchFormatter {
    pub fn new(provisioner: DiskProvisioner, disk: DiskOptions, command_timeout: Duration) -> Self {
        Self {
            provisioner,
            runner: GuestCommandRunner::new(command_timeout),
            disk,
            format: Ext4Format::default(),
        }
    }

    pub fn from_options(options: &UvmDiskOptions) -> Self {
        Self::new(
            DiskProvisioner::for_format(options.disk.image_format),
            options.disk.clone(),
            options.timeouts.command(),
        )
    }

    /// Override the mkfs options.
    pub fn with_format(mut self, format: Ext4Format) -> Self {
        self.format = format;
        self
    }

    /// Requested size rounded up to the floor.
    pub fn effective_size(&self, size_gb: u32) -> u32 {
        size_gb.max(self.disk.min_size_gb)
    }

    /// Whether `size_gb` (after clamping) is the cached size class.
    pub fn is_cached_size(&self, size_gb: u32) -> bool {
        self.effective_size(size_gb) == self.disk.min_size_gb
    }

    /// Provision a formatted scratch disk at `dest`.
    ///
    /// `cache` is consulted and seeded only for the default size class.
    /// Without a cache hit a utility VM that can both execute commands and
    /// hot-add disks is required.
    pub async fn provision(
        &self,
        vm: Option<&dyn UtilityVm>,
        dest: &Path,
        size_gb: u32,
        cache: Option<&Path>,
    ) -> DiskResult<Provisioned> {
        let size_gb = self.effective_size(size_gb);
        let cache = cache.filter(|_| size_gb == self.disk.min_size_gb);

        if let Some(cache) = cache
            && self.provisioner.try_from_cache(cache, dest).await?
        {
            return Ok(Provisioned {
                path: dest.to_path_buf(),
                size_gb,
                source: ScratchSource::FromCache,
                cache_seeded: false,
            });
        }

        let vm = vm.ok_or_else(|| {
            DiskError::Config(
                "cannot create scratch disk as cache is not present and no utility VM supplied"
                    .to_string(),
            )
        })?;
        let caps = GuestCapabilities::resolve(vm)?;

        tracing::debug!(vm = caps.id, path = %dest.display(), size_gb, "Creating scratch disk");
        self.provisioner
            .create_empty(dest, size_gb, self.disk.block_size_mb)
            .await?;

        // The created file stays behind if this fails.
        let attachment = ScsiAttachment::attach(caps.attacher, dest).await?;
        let address = attachment.address();

        let device = match self.format_attached(&caps, address).await {
            Ok(device) => device,
            Err(e) => return Err(attachment.rollback(e).await),
        };

        attachment.detach().await?;

        let cache_seeded = match cache {
            Some(cache) => {
                self.provisioner.seed_cache(dest, cache).await?;
                true
            }
            None => false,
        };

        tracing::debug!(
            path = %dest.display(),
            controller = address.controller,
            lun = address.lun,
            device = %device,
            cache_seeded,
            "Scratch disk provisioned"
        );

        Ok(Provisioned {
            path: dest.to_path_buf(),
            size_gb,
            source: ScratchSource::Formatted { address, device },
            cache_seeded,
        })
    }

    /// Probe, discover and format the disk at `address`. Returns the device
    /// node.
    async fn format_attached(
        &self,
        caps: &GuestCapabilities<'_>,
        address: ScsiAddress,
    ) -> DiskResult<String> {
        let sysfs = address.sysfs_path();
        self.runner
            .run_checked(caps.executor, vec!["test".into(), "-d".into(), sysfs], None)
            .await?;

        let mut listing = CaptureBuffer::new();
        self.runner
            .run_checked(
                caps.executor,
                vec!["ls".into(), address.block_path()],
                Some(&mut listing),
            )
            .await?;
        let device = device_path(&listing.to_string_lossy())?;
        tracing::debug!(
            controller = address.controller,
            lun = address.lun,
            device = %device,
            "Discovered scratch device"
        );

        self.runner
            .run_checked(caps.executor, self.format.args(&device), None)
            .await?;

        Ok(device)
    }
}
