//! Utility VM reached through host commands.
//!
//! [`CommandGuest`] runs guest processes as `exec_prefix + args` on the host,
//! so a prefix such as `ssh uvm` (or `hvc exec uvm --`) reaches a running
//! guest and an empty prefix treats the local machine as the guest. SCSI
//! hot-add/remove is delegated to configured hook commands.
//!
//! # Example
//!
//! ```no_run
//! # use uvmdisk::guest::CommandGuest;
//! let guest = CommandGuest::new("uvm")
//!     .exec_prefix(["ssh", "uvm"])
//!     .attach_hooks(
//!         ["uvm-ctl", "scsi-add", "{path}", "{controller}", "{lun}"],
//!         ["uvm-ctl", "scsi-remove", "{controller}", "{lun}"],
//!     );
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use uvmdisk_shared::errors::{DiskError, DiskResult};

use super::{GuestExecutor, GuestProcess, GuestReader, GuestWriter, ProcessRequest, UtilityVm};
use crate::runtime::constants::scsi as const_scsi;
use crate::runtime::options::GuestOptions;
use crate::scsi::{DeviceAttacher, ScsiAddress};

#[derive(Clone, Debug)]
struct AttachHooks {
    attach: Vec<String>,
    detach: Vec<String>,
}

/// A utility VM driven through host-side commands.
pub struct CommandGuest {
    id: String,
    exec_prefix: Vec<String>,
    hooks: Option<AttachHooks>,
    /// Live attachments, keyed by address.
    attachments: Mutex<BTreeMap<ScsiAddress, PathBuf>>,
}

impl CommandGuest {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            exec_prefix: Vec::new(),
            hooks: None,
            attachments: Mutex::new(BTreeMap::new()),
        }
    }

    /// Build from configuration.
    pub fn from_options(options: &GuestOptions) -> Self {
        let guest = Self::new(options.id.clone()).exec_prefix(options.exec_prefix.clone());
        match (&options.attach_hook, &options.detach_hook) {
            (Some(attach), Some(detach)) => guest.attach_hooks(attach.clone(), detach.clone()),
            _ => guest,
        }
    }

    /// Prefix prepended to every guest argument vector.
    pub fn exec_prefix<I, S>(mut self, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exec_prefix = prefix.into_iter().map(Into::into).collect();
        self
    }

    /// Host commands that hot-add and hot-remove a disk. `{path}`,
    /// `{controller}` and `{lun}` are substituted in every argument.
    pub fn attach_hooks<A, D, S>(mut self, attach: A, detach: D) -> Self
    where
        A: IntoIterator<Item = S>,
        D: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hooks = Some(AttachHooks {
            attach: attach.into_iter().map(Into::into).collect(),
            detach: detach.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Disks currently attached through this handle.
    pub fn attachments(&self) -> Vec<(ScsiAddress, PathBuf)> {
        self.attachments
            .lock()
            .iter()
            .map(|(addr, path)| (*addr, path.clone()))
            .collect()
    }

    /// Reserve the lowest free (controller, lun).
    fn reserve_slot(&self, path: &Path) -> DiskResult<ScsiAddress> {
        let mut attachments = self.attachments.lock();
        for controller in 0..const_scsi::MAX_CONTROLLERS {
            for lun in 0..const_scsi::LUNS_PER_CONTROLLER {
                let addr = ScsiAddress::new(controller, lun);
                if !attachments.contains_key(&addr) {
                    attachments.insert(addr, path.to_path_buf());
                    return Ok(addr);
                }
            }
        }
        Err(DiskError::Attach(format!(
            "no free SCSI slot on utility VM '{}' for {}",
            self.id,
            path.display()
        )))
    }
}

fn expand_hook(template: &[String], path: &Path, addr: ScsiAddress) -> Vec<String> {
    let path = path.display().to_string();
    let controller = addr.controller.to_string();
    let lun = addr.lun.to_string();
    template
        .iter()
        .map(|arg| {
            arg.replace("{path}", &path)
                .replace("{controller}", &controller)
                .replace("{lun}", &lun)
        })
        .collect()
}

/// Run a host hook, returning its stderr on failure.
async fn run_hook(argv: &[String]) -> Result<(), String> {
    let Some((program, args)) = argv.split_first() else {
        return Err("hook command is empty".to_string());
    };
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| format!("failed to run `{}`: {}", argv.join(" "), e))?;
    if !output.status.success() {
        return Err(format!(
            "`{}` exited with {}: {}",
            argv.join(" "),
            exit_code(output.status),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

impl UtilityVm for CommandGuest {
    fn id(&self) -> &str {
        &self.id
    }

    fn executor(&self) -> Option<&dyn GuestExecutor> {
        Some(self)
    }

    fn attacher(&self) -> Option<&dyn DeviceAttacher> {
        if self.hooks.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl GuestExecutor for CommandGuest {
    async fn create_process(&self, request: ProcessRequest) -> DiskResult<Box<dyn GuestProcess>> {
        if !request.create_in_utility_vm {
            return Err(DiskError::Launch(format!(
                "utility VM '{}' only runs processes in the utility VM itself",
                self.id
            )));
        }

        let mut argv = self.exec_prefix.iter().chain(request.args.iter());
        let Some(program) = argv.next() else {
            return Err(DiskError::Launch("empty argument vector".to_string()));
        };

        let piped = |on: bool| if on { Stdio::piped() } else { Stdio::null() };
        let child = Command::new(program)
            .args(argv)
            .stdin(piped(request.stdin))
            .stdout(piped(request.stdout))
            .stderr(piped(request.stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DiskError::Launch(format!(
                    "failed to start `{}` in utility VM '{}': {}",
                    request.display(),
                    self.id,
                    e
                ))
            })?;

        Ok(Box::new(CommandProcess { child, exit: None }))
    }
}

#[async_trait]
impl DeviceAttacher for CommandGuest {
    async fn attach(&self, path: &Path) -> DiskResult<ScsiAddress> {
        let Some(hooks) = &self.hooks else {
            return Err(DiskError::Unsupported(format!(
                "utility VM '{}' has no attach hook",
                self.id
            )));
        };

        let addr = self.reserve_slot(path)?;
        let argv = expand_hook(&hooks.attach, path, addr);
        if let Err(reason) = run_hook(&argv).await {
            self.attachments.lock().remove(&addr);
            return Err(DiskError::Attach(format!(
                "failed to hot-add {} to utility VM '{}': {}",
                path.display(),
                self.id,
                reason
            )));
        }

        tracing::debug!(path = %path.display(), controller = addr.controller, lun = addr.lun, "Hot-added disk");
        Ok(addr)
    }

    async fn detach(&self, path: &Path, addr: ScsiAddress) -> DiskResult<()> {
        let Some(hooks) = &self.hooks else {
            return Err(DiskError::Unsupported(format!(
                "utility VM '{}' has no detach hook",
                self.id
            )));
        };

        let attached = self.attachments.lock().get(&addr).cloned();
        if attached.as_deref() != Some(path) {
            return Err(DiskError::Detach(format!(
                "{} is not attached at {} on utility VM '{}'",
                path.display(),
                addr,
                self.id
            )));
        }

        let argv = expand_hook(&hooks.detach, path, addr);
        run_hook(&argv).await.map_err(|reason| {
            DiskError::Detach(format!(
                "failed to hot-remove {} from utility VM '{}': {}",
                path.display(),
                self.id,
                reason
            ))
        })?;

        self.attachments.lock().remove(&addr);
        tracing::debug!(path = %path.display(), controller = addr.controller, lun = addr.lun, "Hot-removed disk");
        Ok(())
    }
}

struct CommandProcess {
    child: Child,
    exit: Option<i32>,
}

#[async_trait]
impl GuestProcess for CommandProcess {
    fn pid(&self) -> u32 {
        self.child.id().unwrap_or(0)
    }

    fn take_stdin(&mut self) -> Option<GuestWriter> {
        self.child
            .stdin
            .take()
            .map(|s| Box::new(s) as GuestWriter)
    }

    fn take_stdout(&mut self) -> Option<GuestReader> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as GuestReader)
    }

    fn take_stderr(&mut self) -> Option<GuestReader> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as GuestReader)
    }

    async fn wait(&mut self) -> DiskResult<i32> {
        if let Some(code) = self.exit {
            return Ok(code);
        }
        let status = self.child.wait().await?;
        let code = exit_code(status);
        self.exit = Some(code);
        Ok(code)
    }

    async fn kill(&mut self) -> DiskResult<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        self.child.kill().await?;
        if let Some(status) = self.child.try_wait()? {
            self.exit = Some(exit_code(status));
        }
        Ok(())
    }

    async fn release(mut self: Box<Self>) -> DiskResult<()> {
        // Reap the child so it never lingers as a zombie.
        if self.exit.is_none() && self.child.try_wait()?.is_none() {
            self.child.kill().await?;
        }
        Ok(())
    }
}

/// Exit code of a finished process. Death by signal maps to `128 + signal`,
/// the shell convention (SIGKILL is 137).
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
