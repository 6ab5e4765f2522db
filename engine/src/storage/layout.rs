//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

pub const DEFAULT_BASE_DIR: &str = "/etc/empaas";

/// On-disk layout of the engine
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Layout rooted at the directory holding `settings_path`
    pub fn for_settings_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let base_dir = settings_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        Self { base_dir }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Default notification channels file
    pub fn notifications_file(&self) -> File {
        File::new(self.base_dir.join("notifications.json"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Create the directories the engine writes to
    pub async fn setup(&self) -> Result<(), EngineError> {
        Dir::new(&self.base_dir).create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DIR)
    }
}
