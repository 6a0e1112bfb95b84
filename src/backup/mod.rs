use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Local;
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::env;
use crate::error::UpdateError;

/// Server database directory inside an install.
pub const DATABASE_DIR: &str = "server-database";

/// How much of the install tree is snapshotted before an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BackupScope {
    None,
    #[default]
    DatabaseOnly,
    Everything,
}

impl BackupScope {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            BackupScope::None => "none",
            BackupScope::DatabaseOnly => "database",
            BackupScope::Everything => "everything",
        }
    }
}

impl fmt::Display for BackupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for BackupScope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(BackupScope::None),
            "database" | "db" => Ok(BackupScope::DatabaseOnly),
            "everything" | "all" => Ok(BackupScope::Everything),
            other => Err(format!("unknown backup scope '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupOutcome {
    /// Nothing needed copying (scope `None`, or the source does not exist yet).
    Skipped,
    Created(PathBuf),
}

/// Snapshots an install directory into timestamped folders under a backup root.
#[derive(Clone, Debug)]
pub struct BackupManager {
    root: PathBuf,
}

impl Default for BackupManager {
    fn default() -> Self {
        Self::new(env::backups_dir())
    }
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy the part of `install_dir` selected by `scope`.
    ///
    /// The copy is assembled in a hidden `.partial` directory and renamed into place only
    /// once complete; on failure the partial copy is removed.
    pub fn backup(&self, install_dir: &Path, scope: BackupScope) -> Result<BackupOutcome, UpdateError> {
        let source = match scope {
            BackupScope::None => {
                debug!("backup: scope none, skipping");
                return Ok(BackupOutcome::Skipped);
            }
            BackupScope::DatabaseOnly => install_dir.join(DATABASE_DIR),
            BackupScope::Everything => install_dir.to_path_buf(),
        };
        if !source.is_dir() {
            info!(
                "backup: {} does not exist, nothing to back up",
                source.display()
            );
            return Ok(BackupOutcome::Skipped);
        }
        self.ensure_outside(install_dir)?;

        fs::create_dir_all(&self.root)
            .map_err(|e| UpdateError::backup_at("create backup root", &self.root, e))?;
        let dest = self.unique_destination(install_dir, scope);
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup".into());
        let partial = self.root.join(format!(".{name}.partial"));
        if partial.exists() {
            remove_tree(&partial)?;
        }

        let target = match scope {
            BackupScope::DatabaseOnly => partial.join(DATABASE_DIR),
            _ => partial.clone(),
        };
        info!(
            "backup: copying {} ({scope}) to {}",
            source.display(),
            dest.display()
        );

        let copied = copy_tree(&source, &target).and_then(|files| {
            fs::rename(&partial, &dest)
                .map(|()| files)
                .map_err(|e| UpdateError::backup_at("finalise backup", &dest, e))
        });
        match copied {
            Ok(files) => {
                info!("backup: wrote {files} files to {}", dest.display());
                Ok(BackupOutcome::Created(dest))
            }
            Err(err) => {
                if partial.exists()
                    && let Err(cleanup) = fs::remove_dir_all(&partial)
                {
                    warn!(
                        "backup: failed to discard partial backup {}: {cleanup}",
                        partial.display()
                    );
                }
                Err(err)
            }
        }
    }

    fn ensure_outside(&self, install_dir: &Path) -> Result<(), UpdateError> {
        let install = resolve(install_dir);
        let root = resolve(&self.root);
        if root.starts_with(&install) {
            return Err(UpdateError::backup(
                "check backup root",
                format!(
                    "backup root {} lies inside install dir {}",
                    root.display(),
                    install.display()
                ),
            ));
        }
        Ok(())
    }

    fn unique_destination(&self, install_dir: &Path, scope: BackupScope) -> PathBuf {
        let install_name = install_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "install".into());
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let base = format!("{install_name}_{scope}_{stamp}");

        let mut candidate = self.root.join(&base);
        let mut n = 1;
        while candidate.exists() {
            candidate = self.root.join(format!("{base}_{n}"));
            n += 1;
        }
        candidate
    }
}

/// Recursively copy `from` into `to`, returning the number of files copied.
fn copy_tree(from: &Path, to: &Path) -> Result<usize, UpdateError> {
    let mut files = 0;
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| UpdateError::backup("walk install tree", e))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| UpdateError::backup("walk install tree", e))?;
        let target = to.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| UpdateError::backup_at("create directory", &target, e))?;
        } else if file_type.is_symlink() && entry.path().is_dir() {
            warn!(
                "backup: skipping directory symlink {}",
                entry.path().display()
            );
        } else {
            fs::copy(entry.path(), &target)
                .map_err(|e| UpdateError::backup_at("copy file", entry.path(), e))?;
            files += 1;
        }
    }
    Ok(files)
}

/// Canonical form of `path`, resolving through the parent when `path` does not exist yet.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => resolve(parent).join(name),
        _ => path.to_path_buf(),
    }
}

fn remove_tree(path: &Path) -> Result<(), UpdateError> {
    fs::remove_dir_all(path).map_err(|e| UpdateError::backup_at("remove stale partial backup", path, e))
}
