//! Scratch disk provisioning and tar/disk conversion for utility VMs.
//!
//! Containers running inside a lightweight utility VM need a writable
//! scratch disk and a way to move layers in and out of disk images. This
//! crate creates the image on the host, hot-adds it to the guest, formats
//! it from inside the guest, hot-removes it and caches the result
//! ([`ScratchFormatter`]), and converts between tar streams and disk images
//! through in-guest helpers ([`StreamBridge`]).
//!
//! The utility VM itself is supplied by the caller through [`UtilityVm`];
//! [`CommandGuest`] is a ready-made one driven by host commands.

pub mod bridge;
pub mod guest;
pub mod runtime;
pub mod scratch;
pub mod scsi;
mod transfer;
pub mod volumes;

pub use bridge::{ArchiveStream, DiskKind, StreamBridge};
pub use guest::{
    CommandGuest, GuestCapabilities, GuestCommandRunner, GuestExecutor, GuestProcess,
    ProcessRequest, UtilityVm,
};
pub use runtime::options::{
    DiskOptions, GuestOptions, HelperCommands, ImageFormat, TimeoutOptions, UvmDiskOptions,
    default_home_dir,
};
pub use scratch::{Provisioned, ScratchFormatter, ScratchSource};
pub use scsi::{DeviceAttacher, ScsiAddress};
pub use transfer::ByteCount;
pub use volumes::{DiskProvisioner, VirtualDiskFile};

pub use uvmdisk_shared::{DiskError, DiskResult};
