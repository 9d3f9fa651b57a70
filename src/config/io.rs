//! Location, loading and storing of `ryse-shade.json`, plus the lock that keeps a second process
//! from driving the same shade.

use std::env::current_exe;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use directories_next::ProjectDirs;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{debug, info};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::config::types::Config;
use crate::error::ConfigError;

const CONFIG_FILE_NAME: &str = "ryse-shade.json";

/// `/opt/ryse/ryse-shade` -> `/opt/ryse/ryse-shade.json`, but only if that file exists.
fn portable_path() -> Option<PathBuf> {
    let mut path = current_exe()
        .map_err(|err| debug!("Executable path unavailable: {}", err))
        .ok()?;

    (path.set_extension("json") && path.is_file()).then_some(path)
}

fn user_path() -> Option<PathBuf> {
    let dirs = ProjectDirs::from("", "ryse", "ryse-shade")?;
    Some(dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Picks the config file: `explicit` if given, else a portable file next to the executable,
/// else the per-user config directory.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    portable_path()
        .or_else(user_path)
        .ok_or(ConfigError::NoConfigPath)
}

fn parse(content: &[u8]) -> Result<Config, ConfigError> {
    if content.iter().all(u8::is_ascii_whitespace) {
        return Ok(Config::default());
    }

    let content = std::str::from_utf8(content)?;
    Ok(serde_json::from_str(content)?)
}

/// Advisory write lock on the config file. Held for as long as a process drives the shade.
pub struct InstanceLock {
    file: RwLock<std::fs::File>,
}

impl InstanceLock {
    /// Fails at once with [`ConfigError::CanNotLock`] if another process holds the lock.
    pub fn try_acquire(&mut self) -> Result<RwLockWriteGuard<'_, std::fs::File>, ConfigError> {
        self.file
            .try_write()
            .map_err(|source| ConfigError::CanNotLock { source })
    }
}

/// Handle to the open config file. Clones share the same descriptor.
#[derive(Clone)]
pub struct ConfigFile {
    path: PathBuf,
    file: Arc<std::fs::File>,
}

impl ConfigFile {
    /// Opens the file [`resolve_config_path`] picks, creating it and its directory if needed.
    pub fn open(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = resolve_config_path(explicit)?;
        info!("Config file: {}", path.display());

        if let Some(directory) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(ConfigFile { path, file: Arc::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn instance_lock(&self) -> Result<InstanceLock, ConfigError> {
        Ok(InstanceLock { file: RwLock::new(self.file.try_clone()?) })
    }

    fn handle(&self) -> Result<File, ConfigError> {
        Ok(File::from_std(self.file.try_clone()?))
    }

    /// An empty file reads as the defaults.
    pub async fn load(&self) -> Result<Config, ConfigError> {
        let mut file = self.handle()?;
        let mut content = Vec::new();

        file.rewind().await?;
        file.read_to_end(&mut content).await?;
        parse(&content)
    }

    pub async fn store(&self, config: &Config) -> Result<(), ConfigError> {
        let content = serde_json::to_vec_pretty(config)?;
        let mut file = self.handle()?;
        debug!("Writing {} bytes to {}", content.len(), self.path.display());

        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(&content).await?;
        file.flush().await?;
        Ok(())
    }
}
