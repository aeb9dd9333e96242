//! Creation of empty virtual disk images.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use uvmdisk_shared::errors::{DiskError, DiskResult};

use crate::runtime::constants::disk::GB;
use crate::runtime::options::ImageFormat;

/// Writes a new, empty virtual disk image.
///
/// Implementations must refuse to overwrite an existing file.
#[async_trait]
pub trait DiskImageCreator: Send + Sync {
    fn format(&self) -> ImageFormat;

    async fn create(&self, path: &Path, size_gb: u32, block_size_mb: u32) -> DiskResult<()>;
}

/// Sparse raw image: a file of the full capacity with no allocated blocks.
///
/// The block size only applies to formats that carry one, so it is ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct SparseFileCreator;

#[async_trait]
impl DiskImageCreator for SparseFileCreator {
    fn format(&self) -> ImageFormat {
        ImageFormat::Raw
    }

    async fn create(&self, path: &Path, size_gb: u32, _block_size_mb: u32) -> DiskResult<()> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| create_error(path, e))?;
        file.set_len(u64::from(size_gb) * GB)
            .await
            .map_err(|e| create_error(path, e))?;
        file.sync_all().await.map_err(|e| create_error(path, e))?;
        Ok(())
    }
}

pub(crate) fn create_error(path: &Path, err: io::Error) -> DiskError {
    DiskError::Io(format!("failed to create {}: {}", path.display(), err))
}
