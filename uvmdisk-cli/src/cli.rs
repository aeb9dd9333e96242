//! CLI definition and argument parsing for uvmdisk-cli.
//! This module contains the main CLI structure, subcommands, and the global
//! flags that select home directory and utility VM.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use uvmdisk::{CommandGuest, GuestOptions, UvmDiskOptions, default_home_dir};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "uvmdisk",
    author,
    version,
    about = "Scratch disk provisioning for utility VMs"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
#[non_exhaustive]
pub enum Commands {
    /// Create a formatted ext4 scratch disk
    Provision(crate::commands::provision::ProvisionArgs),

    /// Convert a tar archive into a disk image inside the utility VM
    Tar2vhd(crate::commands::tar2vhd::Tar2VhdArgs),

    /// Export a disk image as a tar archive
    Vhd2tar(crate::commands::vhd2tar::Vhd2TarArgs),

    /// Generate shell completion scripts
    #[command(hide = true)]
    Completion(crate::commands::completion::CompletionArgs),
}

// ============================================================================
// GLOBAL FLAGS
// ============================================================================

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalFlags {
    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,

    /// uvmdisk home directory
    #[arg(long, global = true, env = "UVMDISK_HOME")]
    pub home: Option<PathBuf>,

    /// Host command that runs a process in the utility VM, e.g. "ssh uvm"
    #[arg(long, global = true, value_name = "COMMAND", conflicts_with = "local")]
    pub guest_exec: Option<String>,

    /// Use the local machine as the utility VM
    #[arg(long, global = true)]
    pub local: bool,

    /// Host command that hot-adds a disk ({path}, {controller}, {lun})
    #[arg(long, global = true, value_name = "COMMAND", requires = "detach_hook")]
    pub attach_hook: Option<String>,

    /// Host command that hot-removes a disk ({path}, {controller}, {lun})
    #[arg(long, global = true, value_name = "COMMAND", requires = "attach_hook")]
    pub detach_hook: Option<String>,
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(String::from).collect()
}

impl GlobalFlags {
    pub fn home_dir(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(default_home_dir)
    }

    /// Options from `{home}/config.json`, overridden by flags.
    pub fn load_options(&self) -> anyhow::Result<UvmDiskOptions> {
        let mut options = crate::config::load_config(&self.home_dir());

        if self.local || self.guest_exec.is_some() || self.attach_hook.is_some() {
            let guest = options.guest.get_or_insert_with(GuestOptions::default);
            if self.local {
                guest.exec_prefix = Vec::new();
            }
            if let Some(exec) = &self.guest_exec {
                guest.exec_prefix = split_command(exec);
            }
            if let (Some(attach), Some(detach)) = (&self.attach_hook, &self.detach_hook) {
                guest.attach_hook = Some(split_command(attach));
                guest.detach_hook = Some(split_command(detach));
            }
        }

        options.sanitize().context("invalid configuration")?;
        Ok(options)
    }

    /// The configured utility VM, if any.
    pub fn guest(&self, options: &UvmDiskOptions) -> Option<CommandGuest> {
        options.guest.as_ref().map(CommandGuest::from_options)
    }
}
