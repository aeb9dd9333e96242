//! ext4 formatting of a freshly attached scratch device.
//!
//! The filesystem is created inside the guest with `mkfs.ext4`, so this
//! module only builds the argument vector.

/// Options passed to `mkfs.ext4`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ext4Format {
    /// Defer inode table initialization to the kernel.
    pub lazy_itable_init: bool,
    /// `-O` feature list, `^` disables a feature.
    pub features: Vec<String>,
    pub quiet: bool,
}

impl Default for Ext4Format {
    /// Scratch profile: no journal, sparse_super2, uninit_bg, no resize inode.
    fn default() -> Self {
        Self {
            lazy_itable_init: true,
            features: ["^has_journal", "sparse_super2", "uninit_bg", "^resize_inode"]
                .into_iter()
                .map(String::from)
                .collect(),
            quiet: true,
        }
    }
}

impl Ext4Format {
    /// Argument vector that formats `device`.
    pub fn args(&self, device: &str) -> Vec<String> {
        let mut args = vec!["mkfs.ext4".to_string()];
        if self.quiet {
            args.push("-q".to_string());
        }
        if self.lazy_itable_init {
            args.push("-E".to_string());
            args.push("lazy_itable_init=1".to_string());
        }
        if !self.features.is_empty() {
            args.push("-O".to_string());
            args.push(self.features.join(","));
        }
        args.push(device.to_string());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_profile_args() {
        assert_eq!(
            Ext4Format::default().args("/dev/sdb").join(" "),
            "mkfs.ext4 -q -E lazy_itable_init=1 -O ^has_journal,sparse_super2,uninit_bg,^resize_inode /dev/sdb"
        );
    }

    #[test]
    fn test_plain_args() {
        let fmt = Ext4Format {
            lazy_itable_init: false,
            features: Vec::new(),
            quiet: false,
        };
        assert_eq!(fmt.args("/dev/sdc"), vec!["mkfs.ext4", "/dev/sdc"]);
    }
}
