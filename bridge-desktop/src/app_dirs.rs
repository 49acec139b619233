//! Default on-disk locations for the desktop/kiosk build

use std::path::PathBuf;

const APP_DIR: &str = "lookout";

/// Directories used by the sync core when the host does not choose its own
///
/// Mirrors the XDG layout: the photo cache under the cache dir, the
/// settings database and token file under the data dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDirectories {
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl AppDirectories {
    /// Resolve platform defaults, falling back to `~/.local/share` and the
    /// temp dir when the platform does not report them.
    pub fn resolve() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR);

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".local")
                    .join("share")
            })
            .join(APP_DIR);

        Self { cache_dir, data_dir }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            cache_dir: root.join("cache"),
            data_dir: root.join("data"),
        }
    }

    pub fn settings_db(&self) -> PathBuf {
        self.data_dir.join("settings.db")
    }

    pub fn tokens_dir(&self) -> PathBuf {
        self.data_dir.join("tokens")
    }
}
