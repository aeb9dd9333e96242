//! Guest process execution.
//!
//! A utility VM is an opaque handle owned by the caller. What this crate
//! needs from it is expressed as capabilities: [`GuestExecutor`] to run a
//! process inside the guest and [`DeviceAttacher`] to hot-add disks. A handle
//! implements either, both or neither, and operations narrow it once at
//! entry through [`GuestCapabilities`].

mod command;
mod runner;
mod stdio;

pub use command::CommandGuest;
pub use runner::{GuestCommandRunner, ProcessGuard, RunOutput};
pub use stdio::{CaptureBuffer, GuestStdio};

use crate::scsi::DeviceAttacher;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use uvmdisk_shared::errors::{DiskError, DiskResult};

/// Host side of a guest stdin pipe.
pub type GuestWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Host side of a guest stdout/stderr pipe.
pub type GuestReader = Box<dyn AsyncRead + Send + Unpin>;

/// Handle to a running utility VM.
pub trait UtilityVm: Send + Sync {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    /// Process execution inside the guest, if this handle supports it.
    fn executor(&self) -> Option<&dyn GuestExecutor>;

    /// SCSI hot-add/remove, if this handle supports it.
    fn attacher(&self) -> Option<&dyn DeviceAttacher>;
}

/// Request to create one process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessRequest {
    /// Argument vector; `args[0]` is the program.
    pub args: Vec<String>,

    /// Run inside the utility VM itself rather than in a container hosted
    /// by it. Everything this crate runs sets this.
    pub create_in_utility_vm: bool,

    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl ProcessRequest {
    /// A utility VM process with no stdio pipes.
    pub fn in_utility_vm<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            create_in_utility_vm: true,
            stdin: false,
            stdout: false,
            stderr: false,
        }
    }

    pub fn stdin(mut self, piped: bool) -> Self {
        self.stdin = piped;
        self
    }

    pub fn stdout(mut self, piped: bool) -> Self {
        self.stdout = piped;
        self
    }

    pub fn stderr(mut self, piped: bool) -> Self {
        self.stderr = piped;
        self
    }

    /// The command line, for logs and error messages.
    pub fn display(&self) -> String {
        self.args.join(" ")
    }
}

/// Starts processes inside a guest.
#[async_trait]
pub trait GuestExecutor: Send + Sync {
    /// Start a process. Fails with [`DiskError::Launch`] if the guest cannot
    /// start it.
    async fn create_process(&self, request: ProcessRequest) -> DiskResult<Box<dyn GuestProcess>>;
}

/// One process running inside the guest.
///
/// The handle owns the guest-side stdio pipes for its lifetime and must be
/// released exactly once; [`GuestProcess::release`] consumes it.
#[async_trait]
pub trait GuestProcess: Send {
    /// Guest-assigned process identifier.
    fn pid(&self) -> u32;

    fn take_stdin(&mut self) -> Option<GuestWriter>;

    fn take_stdout(&mut self) -> Option<GuestReader>;

    fn take_stderr(&mut self) -> Option<GuestReader>;

    /// Wait for exit and return the exit code. Not bounded; callers wrap it
    /// in a timeout.
    async fn wait(&mut self) -> DiskResult<i32>;

    /// Terminate the process.
    async fn kill(&mut self) -> DiskResult<()>;

    /// Release the handle and any guest resources behind it.
    async fn release(self: Box<Self>) -> DiskResult<()>;
}

/// The capabilities of a utility VM that provisioning needs.
#[derive(Clone, Copy)]
pub struct GuestCapabilities<'a> {
    pub id: &'a str,
    pub executor: &'a dyn GuestExecutor,
    pub attacher: &'a dyn DeviceAttacher,
}

impl<'a> GuestCapabilities<'a> {
    /// Narrow a VM handle to execution plus attachment.
    pub fn resolve(vm: &'a dyn UtilityVm) -> DiskResult<Self> {
        let executor = vm.executor().ok_or_else(|| {
            DiskError::Config(format!(
                "utility VM '{}' does not support guest command execution",
                vm.id()
            ))
        })?;
        let attacher = vm.attacher().ok_or_else(|| {
            DiskError::Config(format!(
                "utility VM '{}' does not support SCSI hot-add",
                vm.id()
            ))
        })?;
        Ok(Self {
            id: vm.id(),
            executor,
            attacher,
        })
    }
}

/// Narrow a VM handle to execution only.
pub fn require_executor<'a>(
    vm: Option<&'a dyn UtilityVm>,
    operation: &str,
) -> DiskResult<&'a dyn GuestExecutor> {
    let vm = vm.ok_or_else(|| {
        DiskError::Config(format!("cannot {} as no utility VM supplied", operation))
    })?;
    vm.executor().ok_or_else(|| {
        DiskError::Config(format!(
            "cannot {} as utility VM '{}' does not support guest command execution",
            operation,
            vm.id()
        ))
    })
}
