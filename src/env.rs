use std::env;
use std::fs;
use std::path::PathBuf;

/// Returns the root directory used by the launcher for its own data.
pub fn default_app_dir() -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".local").join("share")),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join("sm-launcher")
}

pub fn cache_dir() -> PathBuf {
    default_app_dir().join("cache")
}

pub fn backups_dir() -> PathBuf {
    default_app_dir().join("backups")
}

pub fn runtimes_dir() -> PathBuf {
    default_app_dir().join("runtimes")
}

pub fn settings_path() -> PathBuf {
    default_app_dir().join("launch-settings.json")
}

/// Install location used when no settings exist yet.
pub fn default_install_dir() -> PathBuf {
    default_app_dir().join("StarMade")
}

/// Create the on-disk folder layout expected by the launcher.
pub fn ensure_base_dirs() -> std::io::Result<()> {
    let folders = [default_app_dir(), cache_dir(), backups_dir(), runtimes_dir()];

    for dir in folders {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}
