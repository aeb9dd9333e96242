//! Configuration for uvmdisk.

use crate::runtime::constants::dirs as const_dirs;
use crate::runtime::constants::envs as const_envs;
use crate::runtime::constants::{disk, helpers, timeouts};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uvmdisk_shared::errors::{DiskError, DiskResult};

// ============================================================================
// Disk Options
// ============================================================================

/// On-disk format produced by the disk image creator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Dynamic VHDX created through `qemu-img`.
    #[default]
    Vhdx,
    /// Sparse raw file. Needs no external tooling.
    Raw,
}

/// Sizing of created scratch disks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskOptions {
    /// Smallest disk created, in GB. Requests below it are rounded up, and
    /// it is the only size class kept in the scratch cache.
    ///
    /// Default: 20
    #[serde(default = "default_min_size_gb")]
    pub min_size_gb: u32,

    /// Block size of created disks, in MB.
    ///
    /// Default: 1
    #[serde(default = "default_block_size_mb")]
    pub block_size_mb: u32,

    #[serde(default)]
    pub image_format: ImageFormat,
}

fn default_min_size_gb() -> u32 {
    disk::DEFAULT_SCRATCH_SIZE_GB
}

fn default_block_size_mb() -> u32 {
    disk::DEFAULT_BLOCK_SIZE_MB
}

impl Default for DiskOptions {
    fn default() -> Self {
        Self {
            min_size_gb: default_min_size_gb(),
            block_size_mb: default_block_size_mb(),
            image_format: ImageFormat::default(),
        }
    }
}

// ============================================================================
// Timeout Options
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutOptions {
    /// Wait budget for probe, discovery and format commands.
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,

    /// Budget for each direction of a stream conversion.
    #[serde(default = "default_transfer_secs")]
    pub transfer_secs: u64,
}

fn default_command_secs() -> u64 {
    timeouts::DEFAULT_COMMAND_TIMEOUT_SECS
}

fn default_transfer_secs() -> u64 {
    timeouts::DEFAULT_TRANSFER_TIMEOUT_SECS
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            command_secs: default_command_secs(),
            transfer_secs: default_transfer_secs(),
        }
    }
}

impl TimeoutOptions {
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer_secs)
    }
}

// ============================================================================
// Guest Helper Commands
// ============================================================================

/// Names of the conversion helpers installed in the utility VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperCommands {
    /// Archive on stdin, disk image on stdout. Invoked without arguments.
    #[serde(default = "default_tar_to_vhd")]
    pub tar_to_vhd: String,

    /// Disk image on stdin, archive on stdout. Invoked without arguments.
    #[serde(default = "default_vhd_to_tar")]
    pub vhd_to_tar: String,

    /// Archive of a scratch disk mounted in the guest on stdout.
    /// Invoked as `<helper> -path <mount>`.
    #[serde(default = "default_export_scratch")]
    pub export_scratch: String,
}

fn default_tar_to_vhd() -> String {
    helpers::TAR_TO_VHD.to_string()
}

fn default_vhd_to_tar() -> String {
    helpers::VHD_TO_TAR.to_string()
}

fn default_export_scratch() -> String {
    helpers::EXPORT_SCRATCH.to_string()
}

impl Default for HelperCommands {
    fn default() -> Self {
        Self {
            tar_to_vhd: default_tar_to_vhd(),
            vhd_to_tar: default_vhd_to_tar(),
            export_scratch: default_export_scratch(),
        }
    }
}

// ============================================================================
// Guest Options
// ============================================================================

/// How to reach a running utility VM from the host.
///
/// Commands run as `exec_prefix + args`, so `["ssh", "uvm"]` reaches a guest
/// over ssh and an empty prefix runs them on the local machine.
///
/// Hook templates may use `{path}`, `{controller}` and `{lun}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GuestOptions {
    #[serde(default = "default_guest_id")]
    pub id: String,

    #[serde(default)]
    pub exec_prefix: Vec<String>,

    /// Host command that hot-adds a disk. Without it the guest cannot attach.
    #[serde(default)]
    pub attach_hook: Option<Vec<String>>,

    /// Host command that hot-removes a disk.
    #[serde(default)]
    pub detach_hook: Option<Vec<String>>,
}

fn default_guest_id() -> String {
    "uvm".to_string()
}

impl Default for GuestOptions {
    fn default() -> Self {
        Self {
            id: default_guest_id(),
            exec_prefix: Vec::new(),
            attach_hook: None,
            detach_hook: None,
        }
    }
}

// ============================================================================
// Runtime Options
// ============================================================================

/// Configuration options for uvmdisk.
///
/// Users can create it with defaults and modify fields as needed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UvmDiskOptions {
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,

    #[serde(default)]
    pub disk: DiskOptions,

    #[serde(default)]
    pub timeouts: TimeoutOptions,

    #[serde(default)]
    pub helpers: HelperCommands,

    /// Utility VM to drive. `None` means only cache hits can be served.
    #[serde(default)]
    pub guest: Option<GuestOptions>,

    /// Scratch cache file. Defaults to `{home_dir}/cache/scratch.vhdx`.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
}

/// `$UVMDISK_HOME`, falling back to `~/.uvmdisk`.
pub fn default_home_dir() -> PathBuf {
    std::env::var(const_envs::UVMDISK_HOME)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
            path.push(const_dirs::UVMDISK_DIR);
            path
        })
}

impl Default for UvmDiskOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            disk: DiskOptions::default(),
            timeouts: TimeoutOptions::default(),
            helpers: HelperCommands::default(),
            guest: None,
            cache_path: None,
        }
    }
}

impl UvmDiskOptions {
    /// Options rooted at `home_dir` with every other field defaulted.
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            ..Default::default()
        }
    }

    /// Cache file used for default-size scratch disks.
    pub fn scratch_cache_path(&self) -> PathBuf {
        self.cache_path.clone().unwrap_or_else(|| {
            self.home_dir
                .join(const_dirs::CACHE_DIR)
                .join(const_dirs::SCRATCH_CACHE_FILE)
        })
    }

    /// Validate option combinations.
    pub fn sanitize(&self) -> DiskResult<()> {
        if self.disk.min_size_gb == 0 {
            return Err(DiskError::Config(
                "disk.min_size_gb must be greater than zero".to_string(),
            ));
        }
        if self.disk.block_size_mb == 0 {
            return Err(DiskError::Config(
                "disk.block_size_mb must be greater than zero".to_string(),
            ));
        }
        if self.timeouts.command_secs == 0 || self.timeouts.transfer_secs == 0 {
            return Err(DiskError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }

        for (name, value) in [
            ("helpers.tar_to_vhd", &self.helpers.tar_to_vhd),
            ("helpers.vhd_to_tar", &self.helpers.vhd_to_tar),
            ("helpers.export_scratch", &self.helpers.export_scratch),
        ] {
            if value.trim().is_empty() {
                return Err(DiskError::Config(format!("{} must not be empty", name)));
            }
        }

        if let Some(guest) = &self.guest {
            if guest.attach_hook.is_some() != guest.detach_hook.is_some() {
                return Err(DiskError::Config(
                    "guest.attach_hook and guest.detach_hook must be configured together"
                        .to_string(),
                ));
            }
            for hook in [&guest.attach_hook, &guest.detach_hook].into_iter().flatten() {
                if hook.is_empty() {
                    return Err(DiskError::Config(
                        "guest hook commands must not be empty".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}
