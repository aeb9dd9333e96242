//! Host-side stdio bindings for guest processes.
//!
//! The runner wires whatever endpoints the caller supplies to the guest
//! process's pipes. Command output that only matters for diagnostics
//! (discovery output, mkfs stderr) goes into a [`CaptureBuffer`], which keeps
//! a bounded prefix so a chatty process cannot grow host memory.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};

/// Default capture limit, per stream.
const MAX_CAPTURE: usize = 4096;

/// Host endpoints to connect to a guest process.
///
/// Unset streams are not piped at all.
#[derive(Default)]
pub struct GuestStdio<'a> {
    pub stdin: Option<&'a mut (dyn AsyncRead + Send + Unpin)>,
    pub stdout: Option<&'a mut (dyn AsyncWrite + Send + Unpin)>,
    pub stderr: Option<&'a mut (dyn AsyncWrite + Send + Unpin)>,
}

impl<'a> GuestStdio<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdin(mut self, reader: &'a mut (dyn AsyncRead + Send + Unpin)) -> Self {
        self.stdin = Some(reader);
        self
    }

    pub fn stdout(mut self, writer: &'a mut (dyn AsyncWrite + Send + Unpin)) -> Self {
        self.stdout = Some(writer);
        self
    }

    pub fn stderr(mut self, writer: &'a mut (dyn AsyncWrite + Send + Unpin)) -> Self {
        self.stderr = Some(writer);
        self
    }
}

/// In-memory sink that keeps the first `limit` bytes written to it.
///
/// Writes never fail and never block; bytes past the limit are counted and
/// dropped.
#[derive(Debug)]
pub struct CaptureBuffer {
    data: Vec<u8>,
    limit: usize,
    total: u64,
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_CAPTURE)
    }
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            total: 0,
        }
    }

    /// Total bytes written, including the ones dropped past the limit.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_truncated(&self) -> bool {
        self.total > self.data.len() as u64
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Captured bytes as lossy UTF-8.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl AsyncWrite for CaptureBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let room = this.limit.saturating_sub(this.data.len());
        let keep = room.min(buf.len());
        this.data.extend_from_slice(&buf[..keep]);
        this.total += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_capture_keeps_everything_under_limit() {
        let mut buf = CaptureBuffer::new();
        buf.write_all(b"sdb\n").await.unwrap();
        assert_eq!(buf.to_string_lossy(), "sdb\n");
        assert_eq!(buf.total(), 4);
        assert!(!buf.is_truncated());
    }

    #[tokio::test]
    async fn test_capture_truncates_but_counts() {
        let mut buf = CaptureBuffer::with_limit(8);
        buf.write_all(b"0123456789abcdef").await.unwrap();
        assert_eq!(buf.as_bytes(), b"01234567");
        assert_eq!(buf.total(), 16);
        assert!(buf.is_truncated());
    }

    #[tokio::test]
    async fn test_stdio_builder_sets_streams() {
        let mut input: &[u8] = b"archive";
        let mut out = CaptureBuffer::new();
        let stdio = GuestStdio::new().stdin(&mut input).stdout(&mut out);
        assert!(stdio.stdin.is_some());
        assert!(stdio.stdout.is_some());
        assert!(stdio.stderr.is_none());
    }
}
