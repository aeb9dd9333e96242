//! Run one command inside the guest.
//!
//! [`GuestCommandRunner::run`] is the unit every higher-level operation is
//! built from: start the process, pump the caller's streams to and from its
//! pipes, wait up to a deadline, release the handle. The handle is released
//! on every path, including launch-after-timeout and pipe errors.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use uvmdisk_shared::errors::{DiskError, DiskResult};

use super::stdio::{CaptureBuffer, GuestStdio};
use super::{GuestExecutor, GuestProcess, GuestReader, GuestWriter, ProcessRequest};
use crate::transfer::{ByteCount, copy_counted};

/// Result of a command that ran to completion.
///
/// A non-zero `exit_code` is not an error at this level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_code: i32,
    /// Bytes fed to the process's stdin.
    pub stdin_bytes: u64,
    /// Bytes read from the process's stdout.
    pub stdout_bytes: u64,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Owns a guest process handle until it is released.
///
/// `release` consumes the guard, so a handle cannot be released twice. A
/// guard dropped without release kills and releases the process in the
/// background and logs an error.
pub struct ProcessGuard {
    process: Option<Box<dyn GuestProcess>>,
    command: String,
}

impl ProcessGuard {
    /// Start `request` through `executor`.
    pub async fn spawn(executor: &dyn GuestExecutor, request: ProcessRequest) -> DiskResult<Self> {
        let command = request.display();
        tracing::debug!(command = %command, "Starting guest process");

        let process = executor.create_process(request).await.map_err(|e| match e {
            DiskError::Launch(msg) => DiskError::Launch(msg),
            other => DiskError::Launch(format!("failed to start `{}`: {}", command, other)),
        })?;

        tracing::trace!(command = %command, pid = process.pid(), "Guest process started");
        Ok(Self {
            process: Some(process),
            command,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid())
    }

    pub fn take_stdin(&mut self) -> Option<GuestWriter> {
        self.process.as_mut().and_then(|p| p.take_stdin())
    }

    pub fn take_stdout(&mut self) -> Option<GuestReader> {
        self.process.as_mut().and_then(|p| p.take_stdout())
    }

    pub fn take_stderr(&mut self) -> Option<GuestReader> {
        self.process.as_mut().and_then(|p| p.take_stderr())
    }

    pub async fn wait(&mut self) -> DiskResult<i32> {
        match self.process.as_mut() {
            Some(p) => p.wait().await,
            None => Err(DiskError::Launch(format!(
                "`{}` was already released",
                self.command
            ))),
        }
    }

    pub async fn kill(&mut self) -> DiskResult<()> {
        match self.process.as_mut() {
            Some(p) => p.kill().await,
            None => Ok(()),
        }
    }

    /// Release the handle.
    pub async fn release(mut self) -> DiskResult<()> {
        match self.process.take() {
            Some(p) => {
                tracing::trace!(command = %self.command, "Releasing guest process");
                p.release().await
            }
            None => Ok(()),
        }
    }

    /// Kill, then release. Failures are logged; used on error paths where
    /// a primary error is already being returned.
    pub async fn abort(mut self) {
        if let Err(e) = self.kill().await {
            tracing::warn!(command = %self.command, error = %e, "Failed to kill guest process");
        }
        let command = self.command.clone();
        if let Err(e) = self.release().await {
            tracing::warn!(command = %command, error = %e, "Failed to release guest process");
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        tracing::error!(
            command = %self.command,
            "Guest process handle dropped without release"
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = process.kill().await;
                let _ = process.release().await;
            });
        }
    }
}

/// Executes single commands inside a guest with a default deadline.
#[derive(Clone, Debug)]
pub struct GuestCommandRunner {
    timeout: Duration,
}

impl GuestCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `args` with the default deadline.
    pub async fn run(
        &self,
        executor: &dyn GuestExecutor,
        args: Vec<String>,
        stdio: GuestStdio<'_>,
    ) -> DiskResult<RunOutput> {
        self.run_with_timeout(executor, args, stdio, self.timeout)
            .await
    }

    /// Run `args`, wiring `stdio` to the process, and wait up to `timeout`.
    ///
    /// Returns `Ok` for any exit code. Fails with [`DiskError::Launch`] when
    /// the process cannot start and [`DiskError::Timeout`] when the deadline
    /// passes; in both cases no handle is left behind.
    pub async fn run_with_timeout(
        &self,
        executor: &dyn GuestExecutor,
        args: Vec<String>,
        stdio: GuestStdio<'_>,
        timeout: Duration,
    ) -> DiskResult<RunOutput> {
        let GuestStdio {
            stdin,
            stdout,
            stderr,
        } = stdio;

        let request = ProcessRequest::in_utility_vm(args)
            .stdin(stdin.is_some())
            .stdout(stdout.is_some())
            .stderr(stderr.is_some());

        let mut guard = ProcessGuard::spawn(executor, request).await?;
        let command = guard.command().to_string();

        let pipe_in = guard.take_stdin();
        let pipe_out = guard.take_stdout();
        let pipe_err = guard.take_stderr();

        let stdin_count = ByteCount::new();
        let stdout_count = ByteCount::new();
        let stderr_count = ByteCount::new();

        let outcome = {
            let work = async {
                let (fed, drained_out, drained_err, exit) = tokio::join!(
                    feed_stdin(stdin, pipe_in, &stdin_count),
                    drain_output(pipe_out, stdout, &stdout_count, "stdout"),
                    drain_output(pipe_err, stderr, &stderr_count, "stderr"),
                    guard.wait(),
                );
                fed?;
                drained_out?;
                drained_err?;
                exit
            };
            tokio::time::timeout(timeout, work).await
        };

        match outcome {
            Ok(Ok(exit_code)) => {
                if let Err(e) = guard.release().await {
                    tracing::warn!(command = %command, error = %e, "Failed to release guest process");
                }
                tracing::debug!(command = %command, exit_code, "Guest process exited");
                Ok(RunOutput {
                    exit_code,
                    stdin_bytes: stdin_count.get(),
                    stdout_bytes: stdout_count.get(),
                })
            }
            Ok(Err(e)) => {
                guard.abort().await;
                Err(e)
            }
            Err(_) => {
                tracing::warn!(command = %command, ?timeout, "Guest process timed out");
                guard.abort().await;
                Err(DiskError::Timeout {
                    operation: format!("`{}`", command),
                    after: timeout,
                })
            }
        }
    }

    /// Run `args` and turn a non-zero exit into [`DiskError::GuestCommand`]
    /// carrying the captured stderr.
    pub async fn run_checked(
        &self,
        executor: &dyn GuestExecutor,
        args: Vec<String>,
        stdout: Option<&mut (dyn AsyncWrite + Send + Unpin)>,
    ) -> DiskResult<RunOutput> {
        let command = args.join(" ");
        let mut stderr = CaptureBuffer::new();

        let mut stdio = GuestStdio::new().stderr(&mut stderr);
        if let Some(out) = stdout {
            stdio = stdio.stdout(out);
        }

        let output = self.run(executor, args, stdio).await?;
        if !output.success() {
            return Err(DiskError::GuestCommand {
                command,
                exit_code: output.exit_code,
                stderr: stderr.to_string_lossy(),
            });
        }
        Ok(output)
    }
}

async fn feed_stdin(
    source: Option<&mut (dyn AsyncRead + Send + Unpin)>,
    pipe: Option<GuestWriter>,
    count: &ByteCount,
) -> DiskResult<()> {
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    if let Some(source) = source {
        match copy_counted(source, &mut pipe, count).await {
            Ok(_) => {}
            // The process may legitimately exit without reading everything.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::debug!(bytes = count.get(), "Guest closed stdin early");
            }
            Err(e) => {
                return Err(DiskError::Io(format!("writing guest stdin: {}", e)));
            }
        }
    }
    // Closing the pipe delivers EOF to the guest.
    let _ = pipe.shutdown().await;
    Ok(())
}

async fn drain_output(
    pipe: Option<GuestReader>,
    sink: Option<&mut (dyn AsyncWrite + Send + Unpin)>,
    count: &ByteCount,
    stream: &str,
) -> DiskResult<()> {
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    let result = match sink {
        Some(sink) => copy_counted(&mut pipe, sink, count).await,
        None => copy_counted(&mut pipe, &mut tokio::io::sink(), count).await,
    };
    result
        .map(|_| ())
        .map_err(|e| DiskError::Io(format!("reading guest {}: {}", stream, e)))
}
