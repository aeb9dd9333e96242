//! Conversion between tar archives and disk images through guest helpers.
//!
//! The guest does the conversion; the host only moves bytes. Archive to
//! disk runs the helper with the archive on stdin and the image file on
//! stdout. Disk to archive returns an [`ArchiveStream`] that reads the
//! helper's output live.
//!
//! A stream failure leaves a partially written destination behind.

mod stream;

pub use stream::ArchiveStream;

use std::path::Path;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncRead;
use uvmdisk_shared::errors::{DiskError, DiskResult};

use crate::guest::{
    CaptureBuffer, GuestCommandRunner, GuestStdio, ProcessGuard, ProcessRequest, UtilityVm,
    require_executor,
};
use crate::runtime::options::{HelperCommands, UvmDiskOptions};
use crate::transfer::{ByteCount, CountingWriter};
use stream::{ExportPipes, spawn_export};

/// What kind of disk is being exported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiskKind {
    /// A read-only layer disk on the host. Its bytes are streamed into the
    /// helper.
    ReadOnlyLayer,
    /// A scratch disk already mounted in the guest at `guest_mount_path`.
    /// The helper reads it in place.
    Scratch { guest_mount_path: String },
}

impl DiskKind {
    fn operation(&self) -> &'static str {
        match self {
            DiskKind::ReadOnlyLayer => "Vhd2Tar",
            DiskKind::Scratch { .. } => "export scratch disk",
        }
    }
}

/// Pipes host streams through the guest conversion helpers.
#[derive(Clone, Debug)]
pub struct StreamBridge {
    helpers: HelperCommands,
    transfer_timeout: Duration,
}

impl StreamBridge {
    pub fn new(helpers: HelperCommands, transfer_timeout: Duration) -> Self {
        Self {
            helpers,
            transfer_timeout,
        }
    }

    pub fn from_options(options: &UvmDiskOptions) -> Self {
        Self::new(options.helpers.clone(), options.timeouts.transfer())
    }

    /// Convert `archive` into a disk image at `dest`.
    ///
    /// Creates (or truncates) `dest` and returns the number of bytes the
    /// helper wrote to it. Fails with [`DiskError::Launch`] when the helper
    /// cannot start; later failures are [`DiskError::Transfer`] carrying the
    /// bytes written so far.
    pub async fn archive_to_disk(
        &self,
        vm: Option<&dyn UtilityVm>,
        dest: &Path,
        archive: &mut (dyn AsyncRead + Send + Unpin),
    ) -> DiskResult<u64> {
        let executor = require_executor(vm, "Tar2Vhd")?;

        let file = File::create(dest).await.map_err(|e| {
            DiskError::Io(format!("failed to create {}: {}", dest.display(), e))
        })?;
        let written = ByteCount::new();
        let mut out = CountingWriter::new(file, written.clone());
        let mut stderr = CaptureBuffer::new();

        let helper = self.helpers.tar_to_vhd.clone();
        tracing::debug!(helper = %helper, dest = %dest.display(), "Converting archive to disk");

        let runner = GuestCommandRunner::new(self.transfer_timeout);
        let stdio = GuestStdio::new()
            .stdin(archive)
            .stdout(&mut out)
            .stderr(&mut stderr);
        let output = match runner.run(executor, vec![helper.clone()], stdio).await {
            Ok(output) => output,
            Err(e @ DiskError::Launch(_)) => return Err(e),
            Err(e) => return Err(DiskError::transfer(written.get(), e)),
        };

        if !output.success() {
            return Err(DiskError::transfer(
                written.get(),
                DiskError::GuestCommand {
                    command: helper,
                    exit_code: output.exit_code,
                    stderr: stderr.to_string_lossy(),
                },
            ));
        }

        out.get_mut().sync_all().await.map_err(|e| {
            DiskError::transfer(
                written.get(),
                DiskError::Io(format!("failed to sync {}: {}", dest.display(), e)),
            )
        })?;

        tracing::debug!(
            dest = %dest.display(),
            bytes = output.stdout_bytes,
            archive_bytes = output.stdin_bytes,
            "Archive converted to disk"
        );
        Ok(output.stdout_bytes)
    }

    /// Stream a disk out of the guest as an archive.
    ///
    /// The helper is running when this returns. Dropping the stream before
    /// EOF kills it.
    pub async fn disk_to_archive(
        &self,
        vm: Option<&dyn UtilityVm>,
        source: &Path,
        kind: DiskKind,
    ) -> DiskResult<ArchiveStream> {
        let executor = require_executor(vm, kind.operation())?;

        let (args, input) = match &kind {
            DiskKind::ReadOnlyLayer => {
                let file = File::open(source).await.map_err(|e| {
                    DiskError::Io(format!("failed to open {}: {}", source.display(), e))
                })?;
                (vec![self.helpers.vhd_to_tar.clone()], Some(file))
            }
            DiskKind::Scratch { guest_mount_path } => {
                if guest_mount_path.is_empty() {
                    return Err(DiskError::InvalidArgument(
                        "scratch export needs the guest mount path".to_string(),
                    ));
                }
                (
                    vec![
                        self.helpers.export_scratch.clone(),
                        "-path".to_string(),
                        guest_mount_path.clone(),
                    ],
                    None,
                )
            }
        };

        tracing::debug!(source = %source.display(), ?kind, "Exporting disk as archive");

        let request = ProcessRequest::in_utility_vm(args)
            .stdin(input.is_some())
            .stdout(true)
            .stderr(true);
        let mut guard = ProcessGuard::spawn(executor, request).await?;

        let stdin = guard.take_stdin();
        let stdout = guard.take_stdout();
        let stderr = guard.take_stderr();

        let Some(stdout) = stdout else {
            let command = guard.command().to_string();
            guard.abort().await;
            return Err(DiskError::Launch(format!("`{}` has no stdout pipe", command)));
        };
        let input = match (input, stdin) {
            (Some(file), Some(pipe)) => Some((file, pipe)),
            (Some(_), None) => {
                let command = guard.command().to_string();
                guard.abort().await;
                return Err(DiskError::Launch(format!("`{}` has no stdin pipe", command)));
            }
            (None, _) => None,
        };

        Ok(spawn_export(
            guard,
            ExportPipes {
                input,
                stdout,
                stderr,
            },
            self.transfer_timeout,
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::guest::CommandGuest;
    use tokio::io::AsyncReadExt;

    fn bridge(tar_to_vhd: &str, vhd_to_tar: &str, export_scratch: &str) -> StreamBridge {
        StreamBridge::new(
            HelperCommands {
                tar_to_vhd: tar_to_vhd.to_string(),
                vhd_to_tar: vhd_to_tar.to_string(),
                export_scratch: export_scratch.to_string(),
            },
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_archive_to_disk_without_vm() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("layer.vhd");
        let mut archive: &[u8] = b"tar";

        let err = bridge("cat", "cat", "echo")
            .archive_to_disk(None, &dest, &mut archive)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration error: cannot Tar2Vhd as no utility VM supplied"
        );
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_round_trip_preserves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("layer.vhd");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let guest = CommandGuest::new("local");
        let bridge = bridge("cat", "cat", "echo");

        let mut archive: &[u8] = &payload;
        let written = bridge
            .archive_to_disk(Some(&guest), &dest, &mut archive)
            .await
            .unwrap();
        assert_eq!(written, payload.len() as u64);

        let mut stream = bridge
            .disk_to_archive(Some(&guest), &dest, DiskKind::ReadOnlyLayer)
            .await
            .unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
        assert_eq!(stream.bytes_transferred(), written);
    }

    #[tokio::test]
    async fn test_archive_helper_failure_carries_byte_count() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("layer.vhd");
        let guest = CommandGuest::new("local").exec_prefix(["sh", "-c", "printf abc; exit 2"]);
        let mut archive: &[u8] = b"";

        let err = bridge("tar2vhd", "vhd2tar", "exportSandbox")
            .archive_to_disk(Some(&guest), &dest, &mut archive)
            .await
            .unwrap_err();
        assert_eq!(err.bytes_transferred(), Some(3));
        assert!(matches!(
            err.root_cause(),
            DiskError::GuestCommand { exit_code: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_helper_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("layer.vhd");
        let guest = CommandGuest::new("local");
        let mut archive: &[u8] = b"";

        let err = bridge("/nonexistent/tar2vhd", "cat", "echo")
            .archive_to_disk(Some(&guest), &dest, &mut archive)
            .await
            .unwrap_err();
        assert!(matches!(err, DiskError::Launch(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_scratch_export_passes_mount_path() {
        let dir = tempfile::tempdir().unwrap();
        let guest = CommandGuest::new("local");
        let kind = DiskKind::Scratch {
            guest_mount_path: "/run/scratch/0".to_string(),
        };

        let mut stream = bridge("cat", "cat", "echo")
            .disk_to_archive(Some(&guest), &dir.path().join("sandbox.vhdx"), kind)
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "-path /run/scratch/0\n");
    }

    #[tokio::test]
    async fn test_export_failure_surfaces_as_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("layer.vhd");
        std::fs::write(&source, b"not a disk").unwrap();
        let guest = CommandGuest::new("local")
            .exec_prefix(["sh", "-c", "cat >/dev/null; echo corrupt >&2; exit 1"]);

        let mut stream = bridge("tar2vhd", "vhd2tar", "exportSandbox")
            .disk_to_archive(Some(&guest), &source, DiskKind::ReadOnlyLayer)
            .await
            .unwrap();
        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).await.unwrap_err();

        let disk_err = DiskError::from_io(&err).expect("DiskError inside io::Error");
        assert_eq!(disk_err.bytes_transferred(), Some(0));
        match disk_err.root_cause() {
            DiskError::GuestCommand { stderr, .. } => assert_eq!(stderr.trim(), "corrupt"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stalled_export_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let guest = CommandGuest::new("local").exec_prefix(["sh", "-c", "sleep 30"]);
        let bridge = StreamBridge::new(HelperCommands::default(), Duration::from_millis(200));

        let mut stream = bridge
            .disk_to_archive(
                Some(&guest),
                &dir.path().join("sandbox.vhdx"),
                DiskKind::Scratch {
                    guest_mount_path: "/mnt".to_string(),
                },
            )
            .await
            .unwrap();
        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).await.unwrap_err();
        assert!(DiskError::from_io(&err).unwrap().is_timeout());
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_helper_after_stdout_closes() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("still-running");
        let script = format!("exec 1>&-; sleep 1; touch {}", marker.display());
        let guest = CommandGuest::new("local").exec_prefix(["sh", "-c", script.as_str()]);

        let stream = bridge("tar2vhd", "vhd2tar", "exportSandbox")
            .disk_to_archive(
                Some(&guest),
                &dir.path().join("sandbox.vhdx"),
                DiskKind::Scratch {
                    guest_mount_path: "/mnt".to_string(),
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(stream);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists(), "helper outlived the dropped stream");
    }

    #[tokio::test]
    async fn test_scratch_export_requires_mount_path() {
        let guest = CommandGuest::new("local");
        let err = bridge("cat", "cat", "echo")
            .disk_to_archive(
                Some(&guest),
                Path::new("/tmp/sandbox.vhdx"),
                DiskKind::Scratch {
                    guest_mount_path: String::new(),
                },
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DiskError::InvalidArgument(_)));
    }
}
