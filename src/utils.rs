use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "CivicProximity";
const CONFIG_FILE_NAME: &str = "civic_proximity.toml";

/// Overrides the data directory, mostly for tests and portable installs.
pub const DATA_DIR_ENV: &str = "CIVIC_PROXIMITY_DATA_DIR";

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn home_dir() -> PathBuf {
    env_path("HOME").unwrap_or_else(|| PathBuf::from("."))
}

// Per-user data root the OS expects applications to use.
fn platform_data_root() -> PathBuf {
    if cfg!(target_os = "macos") {
        home_dir().join("Library").join("Application Support")
    } else if cfg!(target_os = "windows") {
        env_path("APPDATA").unwrap_or_else(|| PathBuf::from("."))
    } else {
        env_path("XDG_DATA_HOME").unwrap_or_else(|| home_dir().join(".local").join("share"))
    }
}

/// Where the config file and persisted id lists live.
pub fn app_data_dir() -> PathBuf {
    env_path(DATA_DIR_ENV).unwrap_or_else(|| platform_data_root().join(APP_DIR_NAME))
}

pub fn config_path() -> PathBuf {
    app_data_dir().join(CONFIG_FILE_NAME)
}

/// Creates `path` and any missing parents. Existing directories are fine.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_nested_directories_once() {
        let root = std::env::temp_dir().join(format!("civic_utils_{}", std::process::id()));
        let nested = root.join("a").join("b");
        ensure_dir(&nested).unwrap();
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn blocked_path_reports_which_directory() {
        let root = std::env::temp_dir().join(format!("civic_utils_file_{}", std::process::id()));
        std::fs::write(&root, b"not a directory").unwrap();
        let err = ensure_dir(&root.join("child")).unwrap_err();
        assert!(format!("{err:#}").contains("civic_utils_file_"), "{err:#}");
        let _ = std::fs::remove_file(&root);
    }

    #[test]
    fn config_lives_in_data_dir() {
        assert_eq!(config_path().parent(), Some(app_data_dir().as_path()));
        assert!(config_path().ends_with(CONFIG_FILE_NAME));
    }
}
