use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::env;
use crate::error::UpdateError;
use crate::manifest::VersionEntry;

/// Installed-version marker kept inside the install directory.
pub const MARKER_FILE: &str = "version.txt";
/// Program file whose presence means the game is installed.
pub const GAME_JAR: &str = "StarMade.jar";

const DEFAULT_MEMORY_MB: u32 = 2048;
const NO_VERSION: &str = "NONE";

/// Persisted launcher settings. Field names match the on-disk JSON keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSettings {
    pub install_dir: PathBuf,
    #[serde(default = "default_memory")]
    pub memory: u32,
    #[serde(default)]
    pub launch_args: String,
    #[serde(default = "no_version")]
    pub last_used_version: String,
}

fn default_memory() -> u32 {
    DEFAULT_MEMORY_MB
}

fn no_version() -> String {
    NO_VERSION.into()
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            install_dir: env::default_install_dir(),
            memory: DEFAULT_MEMORY_MB,
            launch_args: String::new(),
            last_used_version: no_version(),
        }
    }
}

impl LaunchSettings {
    /// Build token of the last launched or installed version, if any.
    pub fn last_used_build(&self) -> Option<&str> {
        let value = self.last_used_version.trim();
        (!value.is_empty() && value != NO_VERSION).then_some(value)
    }
}

/// Reads and writes `launch-settings.json`.
#[derive(Clone, Debug)]
pub struct SettingsStore {
    path: PathBuf,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(env::settings_path())
    }
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, writing defaults first when no file exists.
    pub async fn load(&self) -> Result<LaunchSettings, UpdateError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "settings: {} missing, writing defaults",
                    self.path.display()
                );
                let defaults = LaunchSettings::default();
                self.save(&defaults).await?;
                return Ok(defaults);
            }
            Err(err) => return Err(UpdateError::settings("read settings", err)),
        };
        serde_json::from_slice(&bytes).map_err(|e| UpdateError::settings("parse settings", e))
    }

    pub async fn save(&self, settings: &LaunchSettings) -> Result<(), UpdateError> {
        let bytes = serde_json::to_vec_pretty(settings)
            .map_err(|e| UpdateError::settings("serialize settings", e))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| UpdateError::settings("create settings dir", e))?;
        }
        fs::write(&self.path, &bytes)
            .await
            .map_err(|e| UpdateError::settings("write settings", e))
    }
}

pub fn marker_path(install_dir: &Path) -> PathBuf {
    install_dir.join(MARKER_FILE)
}

pub fn game_jar_path(install_dir: &Path) -> PathBuf {
    install_dir.join(GAME_JAR)
}

/// Contents of the installed-version marker, or `None` for a fresh or unreadable install.
pub async fn read_marker(install_dir: &Path) -> Option<String> {
    let path = marker_path(install_dir);
    match fs::read(&path).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).trim().to_owned();
            (!text.is_empty()).then_some(text)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!("storage: unable to read {}: {err}", path.display());
            None
        }
    }
}

/// Write the marker for `entry` into `dir`. Blocking; used while a tree is being staged.
///
/// The old marker is unlinked first, so a staged copy hard-linked to the live marker
/// leaves the live one untouched.
pub fn write_marker(dir: &Path, entry: &VersionEntry) -> std::io::Result<()> {
    let path = marker_path(dir);
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    std::fs::write(path, entry.to_line())
}
