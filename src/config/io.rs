use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;

use directories_next::ProjectDirs;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::info;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::config::types::Config;
use crate::error::ConfigError;

// config lives in the os dependent standard directory, such as %AppData% on
// windows
fn get_config_path() -> Result<PathBuf, ConfigError> {
    ProjectDirs::from("dev", "heartrate-monitor", "heartrate-monitor")
        .map(|dirs| dirs.config_dir().join("heartrate-monitor.json"))
        .ok_or(ConfigError::NoConfigPath)
}

/// Holds the config file lock; keep the guard alive to keep a single
/// monitor instance per config file.
pub struct ConfigLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigLocker {
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<'_, std::fs::File>, ConfigError> {
        self.rw_lock
            .try_write()
            .map_err(|source| ConfigError::CanNotLock { source })
    }
}

pub struct ConfigIO {
    path: PathBuf,
}

impl ConfigIO {
    pub fn new_sync() -> Result<Self, ConfigError> {
        let path = get_config_path()?;
        info!("Using config file {}", path.to_string_lossy());

        let directory = path.parent().ok_or(ConfigError::NoConfigPath)?;
        std::fs::create_dir_all(directory)?;

        Ok(ConfigIO { path })
    }

    pub fn locker(&self) -> Result<ConfigLocker, ConfigError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;

        Ok(ConfigLocker {
            rw_lock: RwLock::new(file),
        })
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // probably the first start
                info!("Config file not found, using defaults");
                return Ok(Config::default());
            }
            Err(source) => return Err(ConfigError::IOError { source }),
        };

        if content.is_empty() {
            return Ok(Config::default());
        }

        Ok(serde_json::from_str(&content)?)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(config)?;

        let mut file = File::create(&self.path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
