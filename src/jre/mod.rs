use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use flate2::read::GzDecoder;
use log::{debug, info, warn};
use tar::Archive;
use tokio::task;
use zip::read::ZipArchive;

use crate::env;
use crate::error::UpdateError;
use crate::manifest::{LAUNCHER_USER_AGENT, compare_versions};
use crate::networking::ArtifactFetcher;
use crate::util::{cancel_requested, format_speed};

const LEGACY_URL: &str = "https://dl.dropboxusercontent.com/s/imxj1o2tusetqou/jre8.zip?dl=0";
const CURRENT_URL: &str = "https://dl.dropboxusercontent.com/s/vkd6y9q4sgojzox/jre18.zip?dl=0";

/// Game versions below this need the legacy runtime.
pub const RUNTIME_CUTOFF: &str = "0.300";

/// Bundled Java runtime flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    Legacy,
    Current,
}

impl RuntimeKind {
    pub fn for_version(version: &str) -> Self {
        if compare_versions(version, RUNTIME_CUTOFF).is_lt() {
            RuntimeKind::Legacy
        } else {
            RuntimeKind::Current
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            RuntimeKind::Legacy => "jre8",
            RuntimeKind::Current => "jre18",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    fn extension(self) -> &'static str {
        match self {
            ArchiveKind::TarGz => ".tar.gz",
            ArchiveKind::Zip => ".zip",
        }
    }
}

/// Downloads and unpacks the bundled runtimes on first use.
#[derive(Clone)]
pub struct RuntimeManager {
    root: PathBuf,
    cache_dir: PathBuf,
    legacy_url: String,
    current_url: String,
    fetcher: ArtifactFetcher,
}

impl Default for RuntimeManager {
    fn default() -> Self {
        Self::new(env::runtimes_dir(), env::cache_dir())
    }
}

impl RuntimeManager {
    pub fn new(root: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache_dir: cache_dir.into(),
            legacy_url: LEGACY_URL.into(),
            current_url: CURRENT_URL.into(),
            fetcher: ArtifactFetcher::new(LAUNCHER_USER_AGENT),
        }
    }

    /// Override where a runtime archive is downloaded from.
    pub fn with_url(mut self, kind: RuntimeKind, url: impl Into<String>) -> Self {
        match kind {
            RuntimeKind::Legacy => self.legacy_url = url.into(),
            RuntimeKind::Current => self.current_url = url.into(),
        }
        self
    }

    fn url(&self, kind: RuntimeKind) -> &str {
        match kind {
            RuntimeKind::Legacy => &self.legacy_url,
            RuntimeKind::Current => &self.current_url,
        }
    }

    pub fn runtime_dir(&self, kind: RuntimeKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    pub fn java_path(&self, kind: RuntimeKind) -> PathBuf {
        let bin = if cfg!(target_os = "windows") {
            Path::new("bin").join("java.exe")
        } else {
            Path::new("bin").join("java")
        };
        self.runtime_dir(kind).join(bin)
    }

    /// Path to the runtime's `java`, downloading and unpacking it when missing.
    pub async fn ensure(
        &self,
        kind: RuntimeKind,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<PathBuf, UpdateError> {
        let java = self.java_path(kind);
        let dir = self.runtime_dir(kind);
        if java.exists() {
            debug!("jre: {} already present at {}", kind.dir_name(), java.display());
            return Ok(java);
        }
        if dir.exists() {
            normalize_layout(&dir)?;
            if java.exists() {
                debug!("jre: runtime found after layout normalization");
                return Ok(java);
            }
            warn!("jre: discarding incomplete runtime at {}", dir.display());
            fs::remove_dir_all(&dir)
                .map_err(|e| UpdateError::apply_at("remove incomplete runtime", &dir, e))?;
        }
        if cancel_requested(&cancel) {
            return Err(UpdateError::Cancelled);
        }

        let url = self.url(kind).to_owned();
        let archive_kind = guess_archive_kind(&url).unwrap_or(ArchiveKind::Zip);
        let archive = self
            .cache_dir
            .join(format!("{}{}", kind.dir_name(), archive_kind.extension()));
        info!("jre: downloading {} from {url}", kind.dir_name());
        self.fetcher
            .fetch(&url, &archive, cancel.clone(), |p| {
                debug!(
                    "jre: {} bytes at {}",
                    p.downloaded,
                    format_speed(p.bytes_per_sec)
                );
            })
            .await?;

        let unpack_dir = dir.clone();
        let unpack_archive = archive.clone();
        let unpacked = task::spawn_blocking(move || {
            unpack(&unpack_archive, archive_kind, &unpack_dir, &cancel)
                .and_then(|()| normalize_layout(&unpack_dir))
        })
        .await
        .map_err(|e| UpdateError::apply("join runtime extraction", e))
        .and_then(|result| result);
        if let Err(err) = fs::remove_file(&archive) {
            warn!("jre: could not remove {}: {err}", archive.display());
        }

        let result = unpacked.and_then(|()| {
            if java.exists() {
                Ok(java.clone())
            } else {
                Err(UpdateError::apply_at(
                    "locate runtime",
                    &java,
                    "archive did not contain a java executable",
                ))
            }
        });
        if result.is_err()
            && dir.exists()
            && let Err(err) = fs::remove_dir_all(&dir)
        {
            warn!("jre: could not remove {}: {err}", dir.display());
        }
        if let Ok(java) = &result {
            info!("jre: ready at {}", java.display());
        }
        result
    }
}

fn guess_archive_kind(url: &str) -> Option<ArchiveKind> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else {
        None
    }
}

fn unpack(
    archive: &Path,
    kind: ArchiveKind,
    dest: &Path,
    cancel: &Option<Arc<AtomicBool>>,
) -> Result<(), UpdateError> {
    info!("jre: extracting {} as {kind:?}", archive.display());
    fs::create_dir_all(dest).map_err(|e| UpdateError::apply_at("create runtime dir", dest, e))?;
    match kind {
        ArchiveKind::TarGz => {
            let file = fs::File::open(archive)
                .map_err(|e| UpdateError::apply_at("open runtime archive", archive, e))?;
            Archive::new(GzDecoder::new(file))
                .unpack(dest)
                .map_err(|e| UpdateError::apply("extract runtime tar.gz", e))
        }
        ArchiveKind::Zip => extract_zip(archive, dest, cancel),
    }
}

fn extract_zip(
    archive: &Path,
    dest: &Path,
    cancel: &Option<Arc<AtomicBool>>,
) -> Result<(), UpdateError> {
    let file = fs::File::open(archive)
        .map_err(|e| UpdateError::apply_at("open runtime archive", archive, e))?;
    let mut zip = ZipArchive::new(file).map_err(|e| UpdateError::apply("read runtime zip", e))?;
    for i in 0..zip.len() {
        if cancel_requested(cancel) {
            return Err(UpdateError::Cancelled);
        }
        let mut entry = zip
            .by_index(i)
            .map_err(|e| UpdateError::apply("read runtime zip", e))?;
        let Some(rel) = entry.enclosed_name() else {
            warn!("jre: skipping unsafe entry {}", entry.name());
            continue;
        };
        let out_path = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .map_err(|e| UpdateError::apply_at("create directory", &out_path, e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| UpdateError::apply_at("create directory", parent, e))?;
        }
        let mut out_file = fs::File::create(&out_path)
            .map_err(|e| UpdateError::apply_at("create file", &out_path, e))?;
        io::copy(&mut entry, &mut out_file)
            .map_err(|e| UpdateError::apply_at("write file", &out_path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // Runtime zips are often built without unix modes; java must stay executable.
            let mode = entry.unix_mode().unwrap_or(0o755);
            let _ = fs::set_permissions(&out_path, fs::Permissions::from_mode(mode));
        }
    }
    Ok(())
}

/// Lift the contents of a lone top-level directory up into `dir`.
fn normalize_layout(dir: &Path) -> Result<(), UpdateError> {
    debug!("jre: normalizing layout in {}", dir.display());
    let mut entries = fs::read_dir(dir).map_err(|e| UpdateError::apply_at("read runtime dir", dir, e))?;
    let first = match entries.next() {
        Some(Ok(entry)) => entry,
        _ => return Ok(()),
    };
    if entries.next().is_some() {
        return Ok(());
    }
    let is_dir = first
        .file_type()
        .map_err(|e| UpdateError::apply_at("read runtime dir", dir, e))?
        .is_dir();
    if !is_dir || first.file_name() == "bin" {
        return Ok(());
    }

    #[cfg_attr(not(target_os = "macos"), allow(unused_mut))]
    let mut subdir = first.path();
    #[cfg(target_os = "macos")]
    {
        let mac_home = subdir.join("Contents").join("Home");
        if mac_home.exists() {
            subdir = mac_home;
        }
    }

    let nested = fs::read_dir(&subdir).map_err(|e| UpdateError::apply_at("read runtime dir", &subdir, e))?;
    for entry in nested {
        let entry = entry.map_err(|e| UpdateError::apply_at("read runtime dir", &subdir, e))?;
        let to = dir.join(entry.file_name());
        fs::rename(entry.path(), &to)
            .map_err(|e| UpdateError::apply_at("flatten runtime dir", &to, e))?;
    }
    fs::remove_dir_all(first.path())
        .map_err(|e| UpdateError::apply_at("flatten runtime dir", &first.path(), e))
}
