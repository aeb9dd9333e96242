use std::path::{Path, PathBuf};

use crate::runtime::options::ImageFormat;

/// A virtual disk image on the host.
///
/// The file is never deleted by this crate; its owner removes it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualDiskFile {
    path: PathBuf,
    size_gb: u32,
    block_size_mb: u32,
    format: ImageFormat,
}

impl VirtualDiskFile {
    pub fn new(path: PathBuf, size_gb: u32, block_size_mb: u32, format: ImageFormat) -> Self {
        Self {
            path,
            size_gb,
            block_size_mb,
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_gb(&self) -> u32 {
        self.size_gb
    }

    pub fn block_size_mb(&self) -> u32 {
        self.block_size_mb
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> u64 {
        u64::from(self.size_gb) * crate::runtime::constants::disk::GB
    }

    pub fn into_path(self) -> PathBuf {
        self.path
    }
}
