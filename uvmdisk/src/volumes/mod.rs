//! Host-side virtual disk files.
//!
//! Creation of empty images, the scratch cache, and the ext4 command used to
//! format an attached disk from inside the guest.

mod creator;
mod disk;
mod ext4;
mod provisioner;
pub mod qemu_img;

pub use creator::{DiskImageCreator, SparseFileCreator};
pub use disk::VirtualDiskFile;
pub use ext4::Ext4Format;
pub use provisioner::DiskProvisioner;
pub use qemu_img::QemuImgCreator;
