//! Live archive stream produced by a guest export helper.
//!
//! Two pumps move data while the helper runs: the input pump copies the
//! local disk into the helper's stdin (read-only layers only) and the output
//! pump forwards the helper's stdout to the reader. A supervisor task owns
//! the process handle and joins the pumps; the first failure cancels the
//! other pump, kills the helper and is delivered to the reader as the final
//! read error. Dropping the stream cancels the same way.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::{CancellationToken, DropGuard};
use uvmdisk_shared::errors::{DiskError, DiskResult};

use crate::guest::{CaptureBuffer, GuestReader, GuestWriter, ProcessGuard};
use crate::transfer::{ByteCount, copy_counted};

/// Chunks buffered between the output pump and the reader.
const CHANNEL_DEPTH: usize = 16;

/// Archive bytes streamed out of the guest.
///
/// Single pass. Read errors carry a [`DiskError`] recoverable with
/// [`DiskError::from_io`]; it is a [`DiskError::Transfer`] holding the number
/// of bytes delivered before the failure.
pub struct ArchiveStream {
    reader: StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>,
    count: ByteCount,
    _cancel: DropGuard,
}

impl ArchiveStream {
    /// Archive bytes received from the guest so far.
    pub fn bytes_transferred(&self) -> u64 {
        self.count.get()
    }
}

impl AsyncRead for ArchiveStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

/// Pipes wired to a started export helper.
pub(crate) struct ExportPipes {
    pub input: Option<(File, GuestWriter)>,
    pub stdout: GuestReader,
    pub stderr: Option<GuestReader>,
}

/// Start supervising `guard` and return the reader side.
pub(crate) fn spawn_export(
    guard: ProcessGuard,
    pipes: ExportPipes,
    timeout: Duration,
) -> ArchiveStream {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let cancel = CancellationToken::new();
    let count = ByteCount::new();

    tokio::spawn(supervise(
        guard,
        pipes,
        tx,
        cancel.clone(),
        count.clone(),
        timeout,
    ));

    ArchiveStream {
        reader: StreamReader::new(ReceiverStream::new(rx)),
        count,
        _cancel: cancel.drop_guard(),
    }
}

async fn supervise(
    mut guard: ProcessGuard,
    pipes: ExportPipes,
    tx: mpsc::Sender<io::Result<Bytes>>,
    cancel: CancellationToken,
    count: ByteCount,
    timeout: Duration,
) {
    let command = guard.command().to_string();
    let ExportPipes {
        input,
        stdout,
        stderr,
    } = pipes;

    let stderr_task = stderr.map(|pipe| tokio::spawn(capture(pipe)));

    let mut pumps = JoinSet::new();
    if let Some((file, pipe)) = input {
        pumps.spawn(cancellable(
            cancel.clone(),
            pump_input(file, pipe, timeout),
        ));
    }
    pumps.spawn(cancellable(
        cancel.clone(),
        pump_output(stdout, tx.clone(), count.clone(), timeout),
    ));

    let mut failure = None;
    while let Some(joined) = pumps.join_next().await {
        let result = joined.unwrap_or_else(|e| {
            Err(DiskError::Io(format!("transfer task failed: {}", e)))
        });
        if let Err(e) = result {
            tracing::debug!(command = %command, error = %e, "Export pump failed, cancelling");
            failure = Some(e);
            cancel.cancel();
            pumps.abort_all();
            break;
        }
    }
    // Reap whatever is left after an abort.
    while pumps.join_next().await.is_some() {}

    let outcome = match failure {
        Some(e) => Err(e),
        None => {
            // The helper may outlive its stdout; a dropped reader still stops it.
            let waited = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                waited = tokio::time::timeout(timeout, guard.wait()) => Some(waited),
            };
            match waited {
                None => Err(DiskError::Io("transfer cancelled".to_string())),
                Some(Ok(Ok(0))) => Ok(()),
                Some(Ok(Ok(exit_code))) => {
                    let stderr = match stderr_task {
                        Some(task) => task.await.unwrap_or_default(),
                        None => String::new(),
                    };
                    Err(DiskError::GuestCommand {
                        command: command.clone(),
                        exit_code,
                        stderr,
                    })
                }
                Some(Ok(Err(e))) => Err(e),
                Some(Err(_)) => Err(DiskError::Timeout {
                    operation: format!("waiting for `{}`", command),
                    after: timeout,
                }),
            }
        }
    };

    let bytes = count.get();
    match outcome {
        Ok(()) => {
            if let Err(e) = guard.release().await {
                tracing::warn!(command = %command, error = %e, "Failed to release guest process");
            }
            tracing::debug!(command = %command, bytes, "Export finished");
        }
        Err(e) => {
            guard.abort().await;
            if cancel.is_cancelled() && tx.is_closed() {
                tracing::debug!(command = %command, bytes, "Export abandoned by reader");
            } else {
                tracing::warn!(command = %command, bytes, error = %e, "Export failed");
                let _ = tx.send(Err(DiskError::transfer(bytes, e).into_io())).await;
            }
        }
    }
}

async fn cancellable<F>(cancel: CancellationToken, work: F) -> DiskResult<()>
where
    F: Future<Output = DiskResult<()>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DiskError::Io("transfer cancelled".to_string())),
        result = work => result,
    }
}

/// Copy the local disk into the helper's stdin, then close it.
async fn pump_input(mut file: File, mut pipe: GuestWriter, timeout: Duration) -> DiskResult<()> {
    let sent = ByteCount::new();
    match tokio::time::timeout(timeout, copy_counted(&mut file, &mut pipe, &sent)).await {
        Ok(Ok(_)) => {}
        // The helper stopped reading; its exit code decides the outcome.
        Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
            tracing::debug!(bytes = sent.get(), "Guest closed stdin early");
        }
        Ok(Err(e)) => return Err(DiskError::Io(format!("copy disk to guest: {}", e))),
        Err(_) => {
            return Err(DiskError::Timeout {
                operation: "copy disk to guest".to_string(),
                after: timeout,
            });
        }
    }
    let _ = pipe.shutdown().await;
    tracing::trace!(bytes = sent.get(), "Disk copied to guest");
    Ok(())
}

/// Forward the helper's stdout to the reader in chunks.
async fn pump_output(
    stdout: GuestReader,
    tx: mpsc::Sender<io::Result<Bytes>>,
    count: ByteCount,
    timeout: Duration,
) -> DiskResult<()> {
    let forward = async {
        let mut chunks = ReaderStream::new(stdout);
        while let Some(chunk) = chunks.next().await {
            let chunk =
                chunk.map_err(|e| DiskError::Io(format!("copy archive from guest: {}", e)))?;
            let len = chunk.len() as u64;
            tx.send(Ok(chunk))
                .await
                .map_err(|_| DiskError::Io("archive reader went away".to_string()))?;
            count.add(len);
        }
        Ok::<(), DiskError>(())
    };

    match tokio::time::timeout(timeout, forward).await {
        Ok(result) => result,
        Err(_) => Err(DiskError::Timeout {
            operation: "copy archive from guest".to_string(),
            after: timeout,
        }),
    }
}

async fn capture(mut pipe: GuestReader) -> String {
    let mut buf = CaptureBuffer::new();
    let _ = copy_counted(&mut pipe, &mut buf, &ByteCount::new()).await;
    buf.to_string_lossy()
}
