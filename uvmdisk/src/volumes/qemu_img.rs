//! Wrapper around the `qemu-img` command-line tool.
//!
//! Used to write dynamic VHDX images, the format utility VMs hot-add.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use uvmdisk_shared::errors::{DiskError, DiskResult};

use super::creator::{DiskImageCreator, create_error};
use crate::runtime::options::ImageFormat;

/// Check if `qemu-img` is available on the system.
pub async fn is_available() -> bool {
    Command::new("qemu-img")
        .arg("--version")
        .output()
        .await
        .is_ok_and(|o| o.status.success())
}

/// Creates dynamic VHDX images with `qemu-img`.
#[derive(Clone, Debug)]
pub struct QemuImgCreator {
    program: String,
}

impl Default for QemuImgCreator {
    fn default() -> Self {
        Self {
            program: "qemu-img".to_string(),
        }
    }
}

impl QemuImgCreator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `qemu-img` binary.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments after the program name.
    fn args(path: &Path, size_gb: u32, block_size_mb: u32) -> Vec<String> {
        vec![
            "create".to_string(),
            "-f".to_string(),
            "vhdx".to_string(),
            "-o".to_string(),
            format!("subformat=dynamic,block_size={}M", block_size_mb),
            path.display().to_string(),
            format!("{}G", size_gb),
        ]
    }
}

#[async_trait]
impl DiskImageCreator for QemuImgCreator {
    fn format(&self) -> ImageFormat {
        ImageFormat::Vhdx
    }

    /// Equivalent to:
    /// `qemu-img create -f vhdx -o subformat=dynamic,block_size=1M <path> <N>G`
    async fn create(&self, path: &Path, size_gb: u32, block_size_mb: u32) -> DiskResult<()> {
        // qemu-img truncates an existing file.
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| create_error(path, e))?
        {
            return Err(DiskError::Io(format!(
                "failed to create {}: file already exists",
                path.display()
            )));
        }

        tracing::debug!(path = %path.display(), size_gb, block_size_mb, "Creating VHDX image");

        let output = Command::new(&self.program)
            .args(Self::args(path, size_gb, block_size_mb))
            .output()
            .await
            .map_err(|e| {
                DiskError::Io(format!(
                    "Failed to run {} create: {}. Install qemu-utils (Debian/Ubuntu) \
                     or qemu-img (Fedora/RHEL), or set disk.image_format to \"raw\"",
                    self.program, e
                ))
            })?;

        if !output.status.success() {
            return Err(DiskError::Io(format!(
                "{} create failed for {}: {}",
                self.program,
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_args() {
        let args = QemuImgCreator::args(Path::new("/tmp/a.vhdx"), 20, 1);
        assert_eq!(
            args.join(" "),
            "create -f vhdx -o subformat=dynamic,block_size=1M /tmp/a.vhdx 20G"
        );
    }

    #[tokio::test]
    async fn test_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.vhdx");
        std::fs::write(&path, b"existing").unwrap();

        let err = QemuImgCreator::new().create(&path, 20, 1).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read(&path).unwrap(), b"existing");
    }

    #[tokio::test]
    async fn test_creates_vhdx_when_available() {
        if !is_available().await {
            eprintln!("qemu-img not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.vhdx");

        QemuImgCreator::new().create(&path, 1, 1).await.unwrap();

        let header = std::fs::read(&path).unwrap();
        assert!(header.starts_with(b"vhdxfile"));
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let creator = QemuImgCreator::with_program("/nonexistent/qemu-img");
        let err = creator
            .create(&dir.path().join("a.vhdx"), 20, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DiskError::Io(_)));
    }
}
