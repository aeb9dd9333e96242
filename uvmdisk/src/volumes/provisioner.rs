//! Empty disk creation and the size-keyed scratch cache.
//!
//! The cache is a single pre-formatted disk of the default size class at a
//! caller-chosen path. It is read by copying it to the destination and
//! written only when missing; an existing entry is never modified.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uvmdisk_shared::errors::{DiskError, DiskResult};

use super::creator::{DiskImageCreator, SparseFileCreator};
use super::disk::VirtualDiskFile;
use super::qemu_img::QemuImgCreator;
use crate::runtime::options::ImageFormat;

/// Creates virtual disk files and moves them in and out of the cache.
#[derive(Clone)]
pub struct DiskProvisioner {
    creator: Arc<dyn DiskImageCreator>,
}

impl DiskProvisioner {
    pub fn new(creator: Arc<dyn DiskImageCreator>) -> Self {
        Self { creator }
    }

    /// Provisioner for `format`: `qemu-img` for VHDX, a sparse file for raw.
    pub fn for_format(format: ImageFormat) -> Self {
        match format {
            ImageFormat::Vhdx => Self::new(Arc::new(QemuImgCreator::new())),
            ImageFormat::Raw => Self::new(Arc::new(SparseFileCreator)),
        }
    }

    pub fn format(&self) -> ImageFormat {
        self.creator.format()
    }

    /// Create a new, empty disk at `path`.
    ///
    /// Fails with [`DiskError::Io`] if the path is unwritable or already
    /// exists.
    pub async fn create_empty(
        &self,
        path: &Path,
        size_gb: u32,
        block_size_mb: u32,
    ) -> DiskResult<VirtualDiskFile> {
        if size_gb == 0 || block_size_mb == 0 {
            return Err(DiskError::InvalidArgument(format!(
                "disk size ({}GB) and block size ({}MB) must be non-zero",
                size_gb, block_size_mb
            )));
        }

        tracing::debug!(path = %path.display(), size_gb, block_size_mb, "Creating empty disk");
        self.creator.create(path, size_gb, block_size_mb).await?;

        Ok(VirtualDiskFile::new(
            path.to_path_buf(),
            size_gb,
            block_size_mb,
            self.creator.format(),
        ))
    }

    /// Copy the cached disk to `dest` if the cache file exists.
    ///
    /// Returns `false` without touching `dest` on a miss.
    pub async fn try_from_cache(&self, cache: &Path, dest: &Path) -> DiskResult<bool> {
        match tokio::fs::metadata(cache).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(DiskError::Io(format!(
                    "cache {} is not a regular file",
                    cache.display()
                )));
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                ) =>
            {
                return Ok(false);
            }
            Err(e) => {
                return Err(DiskError::Io(format!(
                    "failed to stat cache {}: {}",
                    cache.display(),
                    e
                )));
            }
        }

        tokio::fs::copy(cache, dest).await.map_err(|e| {
            DiskError::Io(format!(
                "failed to copy {} to {}: {}",
                cache.display(),
                dest.display(),
                e
            ))
        })?;

        tracing::debug!(cache = %cache.display(), dest = %dest.display(), "Scratch disk served from cache");
        Ok(true)
    }

    /// Copy a freshly formatted disk into the cache.
    ///
    /// The copy is staged next to the cache file and moved into place only
    /// if no cache file exists, so a concurrent seeder or an existing entry
    /// is never overwritten. Every failure is [`DiskError::CacheSeed`].
    pub async fn seed_cache(&self, source: &Path, cache: &Path) -> DiskResult<()> {
        let source = source.to_path_buf();
        let cache = cache.to_path_buf();
        let (from, target) = (source.clone(), cache.clone());

        let result = tokio::task::spawn_blocking(move || stage_and_persist(&from, &target))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r);

        match result {
            Ok(()) => {
                tracing::debug!(cache = %cache.display(), "Seeded scratch cache");
                Ok(())
            }
            Err(reason) => Err(DiskError::CacheSeed {
                cache,
                from: source,
                reason,
            }),
        }
    }
}

fn stage_and_persist(source: &Path, cache: &Path) -> Result<(), String> {
    if cache.exists() {
        return Err("cache file already exists".to_string());
    }

    let dir: PathBuf = match cache.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)
        .map_err(|e| format!("failed to create {}: {}", dir.display(), e))?;

    let staged = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| format!("failed to stage in {}: {}", dir.display(), e))?;
    std::fs::copy(source, staged.path()).map_err(|e| format!("copy failed: {}", e))?;
    staged
        .as_file()
        .sync_all()
        .map_err(|e| format!("sync failed: {}", e))?;

    staged.persist_noclobber(cache).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            "cache file already exists".to_string()
        } else {
            e.error.to_string()
        }
    })?;
    Ok(())
}
