//! Shared fixtures for uvmdisk integration tests.
//!
//! [`FakeVm`] is a scripted utility VM: it records every attach, detach and
//! guest command, answers the provisioning commands the way a Linux guest
//! would, and can be told to fail at any step.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use uvmdisk::guest::{GuestReader, GuestWriter};
use uvmdisk::volumes::DiskImageCreator;
use uvmdisk::{
    DeviceAttacher, DiskError, DiskProvisioner, DiskResult, GuestExecutor, GuestProcess,
    ImageFormat, ProcessRequest, ScratchFormatter, ScsiAddress, UtilityVm, UvmDiskOptions,
};

/// Something the fake guest was asked to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Attach(PathBuf, ScsiAddress),
    Detach(PathBuf, ScsiAddress),
    Command(Vec<String>),
}

/// How the fake guest behaves.
#[derive(Clone, Debug)]
pub struct Script {
    pub supports_attach: bool,
    pub reject_attach: bool,
    pub fail_detach: bool,
    /// Exit code of `test -d`.
    pub probe_exit: i32,
    /// Output of `ls .../block`.
    pub block_listing: String,
    pub mkfs_exit: i32,
    pub mkfs_stderr: String,
    /// Programs the guest cannot start.
    pub unlaunchable: Vec<String>,
    /// Helpers whose stdout stays open until they are killed.
    pub stalled: Vec<String>,
    /// Programs that never exit on their own; `wait` returns once killed.
    pub hung_wait: Vec<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            supports_attach: true,
            reject_attach: false,
            fail_detach: false,
            probe_exit: 0,
            block_listing: "sdb\n".to_string(),
            mkfs_exit: 0,
            mkfs_stderr: String::new(),
            unlaunchable: Vec::new(),
            stalled: Vec::new(),
            hung_wait: Vec::new(),
        }
    }
}

pub struct FakeVm {
    script: Script,
    events: Mutex<Vec<Event>>,
    attachments: Mutex<BTreeMap<ScsiAddress, PathBuf>>,
    started: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    killed: Arc<AtomicUsize>,
}

impl FakeVm {
    pub fn new() -> Self {
        Self::scripted(Script::default())
    }

    pub fn scripted(script: Script) -> Self {
        Self {
            script,
            events: Mutex::new(Vec::new()),
            attachments: Mutex::new(BTreeMap::new()),
            started: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
            killed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Command(args) => Some(args.join(" ")),
                _ => None,
            })
            .collect()
    }

    pub fn attaches(&self) -> Vec<ScsiAddress> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Attach(_, addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    pub fn detaches(&self) -> Vec<ScsiAddress> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Detach(_, addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    /// Disks still attached.
    pub fn attachment_count(&self) -> usize {
        self.attachments.lock().len()
    }

    pub fn processes_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn processes_released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn processes_killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    fn respond(&self, args: &[String]) -> (i32, Vec<u8>, Vec<u8>) {
        match args.first().map(String::as_str) {
            Some("test") => (self.script.probe_exit, Vec::new(), Vec::new()),
            Some("ls") => (0, self.script.block_listing.clone().into_bytes(), Vec::new()),
            Some("mkfs.ext4") => (
                self.script.mkfs_exit,
                Vec::new(),
                self.script.mkfs_stderr.clone().into_bytes(),
            ),
            _ => (0, Vec::new(), Vec::new()),
        }
    }
}

impl UtilityVm for FakeVm {
    fn id(&self) -> &str {
        "fake-uvm"
    }

    fn executor(&self) -> Option<&dyn GuestExecutor> {
        Some(self)
    }

    fn attacher(&self) -> Option<&dyn DeviceAttacher> {
        if self.script.supports_attach {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl GuestExecutor for FakeVm {
    async fn create_process(&self, request: ProcessRequest) -> DiskResult<Box<dyn GuestProcess>> {
        self.events.lock().push(Event::Command(request.args.clone()));

        let program = request.args.first().cloned().unwrap_or_default();
        if self.script.unlaunchable.contains(&program) {
            return Err(DiskError::Launch(format!("{}: not found", program)));
        }

        let (exit_code, stdout, stderr) = self.respond(&request.args);
        self.started.fetch_add(1, Ordering::SeqCst);

        let mut stall = None;
        let stdout = if self.script.stalled.contains(&program) {
            let (writer, reader) = tokio::io::duplex(64);
            stall = Some(writer);
            Box::new(reader) as GuestReader
        } else {
            Box::new(Cursor::new(stdout)) as GuestReader
        };

        Ok(Box::new(FakeProcess {
            exit_code,
            stdin: request.stdin.then(|| Box::new(tokio::io::sink()) as GuestWriter),
            stdout: request.stdout.then_some(stdout),
            stderr: request
                .stderr
                .then(|| Box::new(Cursor::new(stderr)) as GuestReader),
            stall,
            hung: self.script.hung_wait.contains(&program),
            released: self.released.clone(),
            killed: self.killed.clone(),
        }))
    }
}

#[async_trait]
impl DeviceAttacher for FakeVm {
    async fn attach(&self, path: &Path) -> DiskResult<ScsiAddress> {
        if self.script.reject_attach {
            return Err(DiskError::Attach(format!(
                "hot-add of {} rejected",
                path.display()
            )));
        }
        let mut attachments = self.attachments.lock();
        let lun = (0..64u8)
            .find(|lun| !attachments.contains_key(&ScsiAddress::new(0, *lun)))
            .ok_or_else(|| DiskError::Attach("controller full".to_string()))?;
        let addr = ScsiAddress::new(0, lun);
        attachments.insert(addr, path.to_path_buf());
        self.events
            .lock()
            .push(Event::Attach(path.to_path_buf(), addr));
        Ok(addr)
    }

    async fn detach(&self, path: &Path, address: ScsiAddress) -> DiskResult<()> {
        self.events
            .lock()
            .push(Event::Detach(path.to_path_buf(), address));
        if self.script.fail_detach {
            return Err(DiskError::Detach("hot-remove timed out".to_string()));
        }
        self.attachments.lock().remove(&address);
        Ok(())
    }
}

struct FakeProcess {
    exit_code: i32,
    stdin: Option<GuestWriter>,
    stdout: Option<GuestReader>,
    stderr: Option<GuestReader>,
    stall: Option<tokio::io::DuplexStream>,
    hung: bool,
    released: Arc<AtomicUsize>,
    killed: Arc<AtomicUsize>,
}

#[async_trait]
impl GuestProcess for FakeProcess {
    fn pid(&self) -> u32 {
        42
    }

    fn take_stdin(&mut self) -> Option<GuestWriter> {
        self.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<GuestReader> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<GuestReader> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> DiskResult<i32> {
        if self.hung {
            std::future::pending::<()>().await;
        }
        Ok(self.exit_code)
    }

    async fn kill(&mut self) -> DiskResult<()> {
        self.stall = None;
        self.hung = false;
        self.exit_code = 137;
        self.killed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(self: Box<Self>) -> DiskResult<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Contents [`MarkerCreator`] writes for a disk of `size_gb`.
pub fn marker(size_gb: u32) -> String {
    format!("empty {}GB disk\n", size_gb)
}

/// Writes a short marker instead of a full-size image, so cache copies in
/// tests stay small.
pub struct MarkerCreator;

#[async_trait]
impl DiskImageCreator for MarkerCreator {
    fn format(&self) -> ImageFormat {
        ImageFormat::Raw
    }

    async fn create(&self, path: &Path, size_gb: u32, _block_size_mb: u32) -> DiskResult<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(marker(size_gb).as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// Isolated home directory with marker disks, so no `qemu-img` is needed.
pub struct TestContext {
    pub options: UvmDiskOptions,
    pub dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut options = UvmDiskOptions::with_home(dir.path());
        options.disk.image_format = ImageFormat::Raw;
        Self { options, dir }
    }

    pub fn formatter(&self) -> ScratchFormatter {
        self.formatter_with_timeout(self.options.timeouts.command())
    }

    /// Formatter whose guest commands give up after `timeout`.
    pub fn formatter_with_timeout(&self, timeout: Duration) -> ScratchFormatter {
        ScratchFormatter::new(
            DiskProvisioner::new(Arc::new(MarkerCreator)),
            self.options.disk.clone(),
            timeout,
        )
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.options.scratch_cache_path()
    }

    /// Contents of a disk under the test directory.
    pub fn read_disk(&self, path: &Path) -> String {
        std::fs::read_to_string(path).expect("Failed to read disk")
    }
}
