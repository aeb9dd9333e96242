//! Error types used across uvmdisk.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for uvmdisk operations.
pub type DiskResult<T> = Result<T, DiskError>;

#[derive(Debug, Error)]
pub enum DiskError {
    /// Neither a cache entry nor a usable utility VM was available, or the
    /// options are inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// Host file create/copy failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// The guest or the host virtualization layer rejected a hot-add.
    #[error("attach error: {0}")]
    Attach(String),

    /// Hot-remove failed. The disk must not be copied while attached.
    #[error("detach error: {0}")]
    Detach(String),

    /// The guest could not start the process.
    #[error("launch error: {0}")]
    Launch(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// The process ran but exited non-zero.
    #[error("`{command}` returned non-zero exit code ({exit_code}){}", render_stderr(.stderr))]
    GuestCommand {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Provisioning succeeded and the destination disk is valid, but the
    /// cache could not be populated from it.
    #[error("failed to seed cache '{}' from '{}': {reason}", .cache.display(), .from.display())]
    CacheSeed {
        cache: PathBuf,
        from: PathBuf,
        reason: String,
    },

    /// A stream transfer failed after moving `bytes` bytes.
    #[error("transfer failed after {bytes} bytes: {source}")]
    Transfer {
        bytes: u64,
        #[source]
        source: Box<DiskError>,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

fn render_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

impl DiskError {
    /// Wrap an error with the number of bytes moved before it happened.
    pub fn transfer(bytes: u64, source: DiskError) -> Self {
        DiskError::Transfer {
            bytes,
            source: Box::new(source),
        }
    }

    /// The innermost error, looking through `Transfer` wrappers.
    pub fn root_cause(&self) -> &DiskError {
        match self {
            DiskError::Transfer { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), DiskError::Timeout { .. })
    }

    /// Bytes moved before a stream transfer failed, if this is one.
    pub fn bytes_transferred(&self) -> Option<u64> {
        match self {
            DiskError::Transfer { bytes, .. } => Some(*bytes),
            _ => None,
        }
    }

    /// Recover a `DiskError` that travelled through an `io::Error`, as
    /// happens when reading from an archive stream.
    pub fn from_io(err: &std::io::Error) -> Option<&DiskError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<DiskError>())
    }

    /// Convert into an `io::Error` for delivery through `AsyncRead`.
    pub fn into_io(self) -> std::io::Error {
        std::io::Error::other(self)
    }
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for DiskError {
    fn from(err: std::io::Error) -> Self {
        DiskError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DiskError {
    fn from(err: serde_json::Error) -> Self {
        DiskError::Config(format!("JSON error: {}", err))
    }
}
