//! Configuration loading for uvmdisk CLI.
//!
//! Handles loading configuration from `config.json` in the home directory.

use std::path::Path;
use tracing::warn;
use uvmdisk::UvmDiskOptions;
use uvmdisk::runtime::constants::dirs::CONFIG_FILE;

/// Load UvmDiskOptions from the configuration file in the given home directory.
///
/// Returns options with defaults if no config file is found or it cannot be
/// parsed. The home directory always comes from the caller.
pub fn load_config(home_dir: &Path) -> UvmDiskOptions {
    let mut options = try_load_json(home_dir).unwrap_or_default();
    options.home_dir = home_dir.to_path_buf();
    options
}

fn try_load_json(home_dir: &Path) -> Option<UvmDiskOptions> {
    let config_path = home_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        return None;
    }

    let content = match std::fs::read_to_string(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(
                "Failed to read config file {}: {}",
                config_path.display(),
                e
            );
            return None;
        }
    };

    match serde_json::from_str::<UvmDiskOptions>(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(
                "Failed to parse config file {}: {}",
                config_path.display(),
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use uvmdisk::ImageFormat;

    #[test]
    fn test_load_json_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        let config_content = r#"{
            "disk": {"image_format": "raw", "min_size_gb": 8},
            "helpers": {"tar_to_vhd": "/usr/bin/tar2ext4"}
        }"#;
        fs::write(&config_path, config_content).unwrap();

        let options = load_config(temp_dir.path());
        assert_eq!(options.disk.image_format, ImageFormat::Raw);
        assert_eq!(options.disk.min_size_gb, 8);
        assert_eq!(options.helpers.tar_to_vhd, "/usr/bin/tar2ext4");
        assert_eq!(options.helpers.vhd_to_tar, "vhd2tar");
    }

    #[test]
    fn test_load_config_with_home_dir() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("config.json"),
            r#"{"home_dir": "/somewhere/else"}"#,
        )
        .unwrap();

        let options = load_config(temp_dir.path());
        assert_eq!(options.home_dir, temp_dir.path());
    }

    #[test]
    fn test_invalid_json_warns_and_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        let config_content = r#"{"disk": {"min_size_gb": "#; // Truncated JSON
        fs::write(&config_path, config_content).unwrap();

        let options = load_config(temp_dir.path());
        assert_eq!(options.disk.min_size_gb, 20);
        assert!(options.guest.is_none());
    }
}
