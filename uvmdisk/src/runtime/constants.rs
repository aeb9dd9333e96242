//! Product constants for scratch disks and guest interaction.
//!
//! Centralized location for values that `UvmDiskOptions` defaults to.

/// Scratch disk sizing
pub mod disk {
    /// Smallest scratch disk this crate creates, in GB. Disks can be grown
    /// later but never shrunk, so it is also the cached size class.
    pub const DEFAULT_SCRATCH_SIZE_GB: u32 = 20;

    /// Block size of the virtual disks this crate creates, in MB.
    pub const DEFAULT_BLOCK_SIZE_MB: u32 = 1;

    pub const GB: u64 = 1024 * 1024 * 1024;
}

/// Timeouts applied to guest processes
pub mod timeouts {
    /// Budget for short guest commands (probe, discovery, mkfs).
    pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 240;

    /// Budget for each stream transfer loop.
    pub const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 600;
}

/// Names of the in-guest conversion helpers
pub mod helpers {
    pub const TAR_TO_VHD: &str = "tar2vhd";
    pub const VHD_TO_TAR: &str = "vhd2tar";
    pub const EXPORT_SCRATCH: &str = "exportSandbox";
}

/// Guest paths used to discover hot-added SCSI disks
pub mod guest_paths {
    pub const SCSI_DEVICES: &str = "/sys/bus/scsi/devices";
    pub const DEV: &str = "/dev";
}

/// SCSI address space exposed to a utility VM
pub mod scsi {
    pub const MAX_CONTROLLERS: u8 = 4;
    pub const LUNS_PER_CONTROLLER: u8 = 64;
}

/// Environment variables
pub mod envs {
    pub const UVMDISK_HOME: &str = "UVMDISK_HOME";
}

/// Layout of the home directory
pub mod dirs {
    pub const UVMDISK_DIR: &str = ".uvmdisk";
    pub const CACHE_DIR: &str = "cache";
    pub const SCRATCH_CACHE_FILE: &str = "scratch.vhdx";
    pub const CONFIG_FILE: &str = "config.json";
}
