use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use log::{debug, info, warn};
use walkdir::WalkDir;
use zip::read::ZipArchive;

use crate::error::UpdateError;
use crate::manifest::VersionEntry;
use crate::storage;
use crate::util::cancel_requested;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyReport {
    pub install_dir: PathBuf,
    pub files_written: usize,
}

/// Sibling directories used while an update is applied.
#[derive(Clone, Debug)]
struct StagingLayout {
    install: PathBuf,
    staging: PathBuf,
    previous: PathBuf,
}

impl StagingLayout {
    fn new(install_dir: &Path) -> Result<Self, UpdateError> {
        let name = install_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                UpdateError::apply_at("resolve install dir", install_dir, "path has no final component")
            })?;
        let parent = match install_dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(Self {
            install: install_dir.to_path_buf(),
            staging: parent.join(format!(".{name}.staging")),
            previous: parent.join(format!(".{name}.previous")),
        })
    }
}

/// Extracts a build archive over an install directory.
///
/// The archive is unpacked into a staging copy of the install tree, which then replaces the
/// live directory with two renames. A failure before promotion leaves the live tree untouched.
#[derive(Clone, Debug, Default)]
pub struct Installer;

impl Installer {
    pub fn new() -> Self {
        Self
    }

    /// Apply `archive` to `install_dir` and record `entry` as the installed version.
    ///
    /// `progress` receives `(entries_done, entries_total)`.
    pub fn apply<F>(
        &self,
        archive: &Path,
        install_dir: &Path,
        entry: &VersionEntry,
        cancel: Option<Arc<AtomicBool>>,
        mut progress: F,
    ) -> Result<ApplyReport, UpdateError>
    where
        F: FnMut(usize, usize),
    {
        let layout = StagingLayout::new(install_dir)?;
        recover_leftovers(&layout)?;

        let file = fs::File::open(archive)
            .map_err(|e| UpdateError::apply_at("open archive", archive, e))?;
        let mut zip = ZipArchive::new(file).map_err(|e| UpdateError::apply("read archive", e))?;

        info!(
            "install: staging {} ({} entries) in {}",
            archive.display(),
            zip.len(),
            layout.staging.display()
        );
        let staged = seed_staging(&layout)
            .and_then(|()| extract_into(&mut zip, &layout.staging, &cancel, &mut progress))
            .and_then(|files| {
                storage::write_marker(&layout.staging, entry)
                    .map(|()| files)
                    .map_err(|e| UpdateError::apply_at("write version marker", &layout.staging, e))
            });
        let files_written = match staged {
            Ok(files) => files,
            Err(err) => {
                discard(&layout.staging);
                return Err(err);
            }
        };

        if cancel_requested(&cancel) {
            discard(&layout.staging);
            return Err(UpdateError::Cancelled);
        }

        promote(&layout)?;
        info!(
            "install: {} now at {} ({files_written} files written)",
            install_dir.display(),
            entry
        );
        Ok(ApplyReport {
            install_dir: install_dir.to_path_buf(),
            files_written,
        })
    }
}

/// Remove a stale staging tree and finish or undo an interrupted promotion.
fn recover_leftovers(layout: &StagingLayout) -> Result<(), UpdateError> {
    if layout.staging.exists() {
        warn!(
            "install: removing stale staging dir {}",
            layout.staging.display()
        );
        fs::remove_dir_all(&layout.staging)
            .map_err(|e| UpdateError::apply_at("remove stale staging dir", &layout.staging, e))?;
    }
    if layout.previous.exists() {
        if layout.install.exists() {
            warn!(
                "install: removing leftover previous tree {}",
                layout.previous.display()
            );
            fs::remove_dir_all(&layout.previous).map_err(|e| {
                UpdateError::apply_at("remove previous tree", &layout.previous, e)
            })?;
        } else {
            warn!(
                "install: restoring {} from interrupted update",
                layout.install.display()
            );
            fs::rename(&layout.previous, &layout.install)
                .map_err(|e| UpdateError::apply_at("restore previous tree", &layout.install, e))?;
        }
    }
    Ok(())
}

/// Mirror the live install into staging, hard-linking files where the filesystem allows.
fn seed_staging(layout: &StagingLayout) -> Result<(), UpdateError> {
    fs::create_dir_all(&layout.staging)
        .map_err(|e| UpdateError::apply_at("create staging dir", &layout.staging, e))?;
    if !layout.install.is_dir() {
        debug!("install: fresh install, staging starts empty");
        return Ok(());
    }

    for item in WalkDir::new(&layout.install).min_depth(1) {
        let item = item.map_err(|e| UpdateError::apply("walk install dir", e))?;
        let rel = item
            .path()
            .strip_prefix(&layout.install)
            .map_err(|e| UpdateError::apply("walk install dir", e))?;
        let target = layout.staging.join(rel);
        if item.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| UpdateError::apply_at("create staging dir", &target, e))?;
        } else if item.file_type().is_symlink() && item.path().is_dir() {
            warn!(
                "install: not carrying directory symlink {}",
                item.path().display()
            );
        } else if fs::hard_link(item.path(), &target).is_err() {
            fs::copy(item.path(), &target)
                .map_err(|e| UpdateError::apply_at("copy into staging", &target, e))?;
        }
    }
    Ok(())
}

fn extract_into<F>(
    zip: &mut ZipArchive<fs::File>,
    dest: &Path,
    cancel: &Option<Arc<AtomicBool>>,
    progress: &mut F,
) -> Result<usize, UpdateError>
where
    F: FnMut(usize, usize),
{
    let total = zip.len();
    let mut written = 0;
    progress(0, total);

    for i in 0..total {
        if cancel_requested(cancel) {
            return Err(UpdateError::Cancelled);
        }
        let mut item = zip
            .by_index(i)
            .map_err(|e| UpdateError::apply("read archive entry", e))?;
        let rel = item.enclosed_name().ok_or_else(|| {
            UpdateError::apply("read archive entry", format!("unsafe path '{}'", item.name()))
        })?;
        let out_path = dest.join(rel);

        if item.is_dir() {
            fs::create_dir_all(&out_path)
                .map_err(|e| UpdateError::apply_at("create directory", &out_path, e))?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| UpdateError::apply_at("create directory", parent, e))?;
            }
            // Unlink first so a hard-linked live file is never written through.
            match fs::remove_file(&out_path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(UpdateError::apply_at("replace file", &out_path, err)),
            }
            let mut out_file = fs::File::create(&out_path)
                .map_err(|e| UpdateError::apply_at("create file", &out_path, e))?;
            io::copy(&mut item, &mut out_file)
                .map_err(|e| UpdateError::apply_at("write file", &out_path, e))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = item.unix_mode() {
                    let _ = fs::set_permissions(&out_path, fs::Permissions::from_mode(mode));
                }
            }
            written += 1;
        }
        progress(i + 1, total);
    }
    Ok(written)
}

/// Swap the staged tree in for the live one, rolling back if the second rename fails.
fn promote(layout: &StagingLayout) -> Result<(), UpdateError> {
    let had_install = layout.install.exists();
    if had_install {
        if let Err(err) = fs::rename(&layout.install, &layout.previous) {
            discard(&layout.staging);
            return Err(UpdateError::apply_at("move live install aside", &layout.install, err));
        }
    }

    if let Err(err) = fs::rename(&layout.staging, &layout.install) {
        if had_install && let Err(restore) = fs::rename(&layout.previous, &layout.install) {
            warn!(
                "install: failed to restore {} from {}: {restore}",
                layout.install.display(),
                layout.previous.display()
            );
        }
        discard(&layout.staging);
        return Err(UpdateError::apply_at("promote staging dir", &layout.install, err));
    }

    if had_install {
        discard(&layout.previous);
    }
    Ok(())
}

fn discard(path: &Path) {
    if path.exists()
        && let Err(err) = fs::remove_dir_all(path)
    {
        warn!("install: failed to remove {}: {err}", path.display());
    }
}
