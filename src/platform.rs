use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use once_cell::sync::Lazy;

static PROJECT_DIRS: Lazy<Option<ProjectDirs>> = Lazy::new(|| ProjectDirs::from("", "", "testbed"));

/// Per-user data directory; run reports are written beneath it.
pub fn data_dir() -> PathBuf {
    PROJECT_DIRS
        .as_ref()
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".testbed"))
}

/// Per-user config directory; profile overlays live beneath it.
pub fn config_dir() -> PathBuf {
    PROJECT_DIRS
        .as_ref()
        .map(|dirs| dirs.config_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".testbed"))
}

pub fn reports_dir() -> PathBuf {
    [&data_dir(), Path::new("reports")].iter().collect()
}

pub fn profiles_dir() -> PathBuf {
    [&config_dir(), Path::new("profiles")].iter().collect()
}
