#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A `uvmdisk` command with an isolated home directory.
pub struct TestContext {
    pub cmd: Command,
    pub home: TempDir,
}

impl TestContext {
    pub fn home_path(&self) -> &Path {
        self.home.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.home.path().join(name)
    }

    /// Default scratch cache location under the home directory.
    pub fn cache_path(&self) -> PathBuf {
        self.home.path().join("cache").join("scratch.vhdx")
    }

    pub fn write_config(&self, json: &str) {
        std::fs::write(self.home.path().join("config.json"), json)
            .expect("Failed to write config.json");
    }

    /// A fresh command sharing this context's home directory.
    pub fn new_cmd(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("uvmdisk"));
        cmd.env("UVMDISK_HOME", self.home.path());
        cmd.env_remove("RUST_LOG");
        cmd
    }
}

pub fn uvmdisk() -> TestContext {
    let home = TempDir::new().expect("Failed to create temp dir");
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("uvmdisk"));
    cmd.env("UVMDISK_HOME", home.path());
    cmd.env_remove("RUST_LOG");
    TestContext { cmd, home }
}
