use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::backup::BackupScope;
use crate::engine::UpdateRequest;
use crate::error::UpdateError;
use crate::manifest::{Channel, ManifestStore, VersionEntry};
use crate::storage::{self, LaunchSettings};

/// Install directory, channel and version selection for one launcher session.
///
/// Every change goes through a method here; the manifest lists are shared with whoever
/// refreshes them.
pub struct Session {
    install_dir: PathBuf,
    channel: Channel,
    pinned: Option<VersionEntry>,
    installed: Option<VersionEntry>,
    manifests: Arc<ManifestStore>,
}

impl Session {
    pub fn new(install_dir: impl Into<PathBuf>, manifests: Arc<ManifestStore>) -> Self {
        let mut session = Self {
            install_dir: PathBuf::new(),
            channel: Channel::Release,
            pinned: None,
            installed: None,
            manifests,
        };
        session.set_install_dir(install_dir);
        session
    }

    pub fn from_settings(settings: &LaunchSettings, manifests: Arc<ManifestStore>) -> Self {
        Self::new(settings.install_dir.clone(), manifests)
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Point the session at another install. A path to a file selects its directory.
    pub fn set_install_dir(&mut self, path: impl Into<PathBuf>) {
        let mut path = path.into();
        if path.is_file()
            && let Some(parent) = path.parent()
        {
            path = parent.to_path_buf();
        }
        info!("session: install dir {}", path.display());
        self.install_dir = path;
        self.installed = None;
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Switch channel. Any pinned version from another channel is dropped.
    pub fn select_channel(&mut self, channel: Channel) {
        debug!("session: channel {channel}");
        self.channel = channel;
        if self.pinned.as_ref().is_some_and(|e| e.channel() != channel) {
            self.pinned = None;
        }
    }

    /// Pin a specific build of the current channel instead of its newest entry.
    pub fn select_build(&mut self, build: &str) -> Result<&VersionEntry, UpdateError> {
        let entry = self
            .manifests
            .entries(self.channel)
            .iter()
            .find(|e| e.build() == build)
            .cloned()
            .ok_or(UpdateError::VersionNotFound {
                channel: self.channel,
            })?;
        let pinned = self.pinned.insert(entry);
        Ok(&*pinned)
    }

    pub fn manifests(&self) -> &Arc<ManifestStore> {
        &self.manifests
    }

    pub fn installed(&self) -> Option<&VersionEntry> {
        self.installed.as_ref()
    }

    /// Re-read the install marker and match it against the loaded manifests.
    ///
    /// The channel follows the installed entry when one is found.
    pub async fn resolve_installed(&mut self) -> Option<&VersionEntry> {
        self.installed = match storage::read_marker(&self.install_dir).await {
            Some(marker) => self.manifests.resolve_installed(&marker),
            None => None,
        };
        match &self.installed {
            Some(entry) => {
                info!("session: installed version {entry}");
                self.channel = entry.channel();
            }
            None => info!(
                "session: no known version installed in {}",
                self.install_dir.display()
            ),
        }
        self.installed.as_ref()
    }

    /// Newest entry of the selected channel.
    pub fn latest(&self) -> Result<VersionEntry, UpdateError> {
        self.manifests.latest(self.channel)
    }

    /// The entry an update would install: the pinned build, else the newest.
    pub fn target(&self) -> Result<VersionEntry, UpdateError> {
        match &self.pinned {
            Some(entry) => Ok(entry.clone()),
            None => self.latest(),
        }
    }

    pub fn is_up_to_date(&self) -> bool {
        match (&self.installed, self.target()) {
            (Some(installed), Ok(target)) => *installed == target,
            _ => false,
        }
    }

    pub fn update_request(&self, scope: BackupScope) -> Result<UpdateRequest, UpdateError> {
        Ok(UpdateRequest {
            install_dir: self.install_dir.clone(),
            entry: self.target()?,
            scope,
        })
    }

    /// Record a finished update so the next resolve sees it without re-reading the marker.
    pub fn mark_installed(&mut self, entry: VersionEntry) {
        self.channel = entry.channel();
        self.installed = Some(entry);
    }
}
