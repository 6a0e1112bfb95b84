use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::join_all;
use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{Channel, ManifestClient, VersionEntry};
use crate::error::UpdateError;

/// Outcome of refreshing every channel once.
#[derive(Clone, Debug, Default)]
pub struct RefreshReport {
    pub results: Vec<(Channel, Result<usize, UpdateError>)>,
}

impl RefreshReport {
    pub fn failures(&self) -> impl Iterator<Item = (Channel, &UpdateError)> {
        self.results
            .iter()
            .filter_map(|(channel, result)| result.as_ref().err().map(|err| (*channel, err)))
    }

    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Per-channel entry lists, each replaced wholesale on a successful refresh.
///
/// Readers get an `Arc` snapshot and therefore always see a complete list.
pub struct ManifestStore {
    release: RwLock<Arc<Vec<VersionEntry>>>,
    dev: RwLock<Arc<Vec<VersionEntry>>>,
    pre: RwLock<Arc<Vec<VersionEntry>>>,
    ready: watch::Sender<bool>,
}

impl Default for ManifestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestStore {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            release: RwLock::default(),
            dev: RwLock::default(),
            pre: RwLock::default(),
            ready,
        }
    }

    fn slot(&self, channel: Channel) -> &RwLock<Arc<Vec<VersionEntry>>> {
        match channel {
            Channel::Release => &self.release,
            Channel::Dev => &self.dev,
            Channel::Pre => &self.pre,
        }
    }

    /// Snapshot of a channel's entries, newest first.
    pub fn entries(&self, channel: Channel) -> Arc<Vec<VersionEntry>> {
        self.slot(channel)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new list for `channel`. The list must already be sorted newest first.
    pub fn replace(&self, channel: Channel, entries: Vec<VersionEntry>) {
        *self
            .slot(channel)
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(entries);
    }

    pub fn latest(&self, channel: Channel) -> Result<VersionEntry, UpdateError> {
        self.entries(channel)
            .first()
            .cloned()
            .ok_or(UpdateError::VersionNotFound { channel })
    }

    /// Find the entry named by an installed-version marker, searching Release, Dev, then Pre.
    pub fn resolve_installed(&self, marker: &str) -> Option<VersionEntry> {
        Channel::ALL.into_iter().find_map(|channel| {
            self.entries(channel)
                .iter()
                .find(|entry| entry.matches_marker(marker))
                .cloned()
        })
    }

    /// Find an entry by its build token, e.g. the persisted last used version.
    pub fn find_build(&self, build: &str) -> Option<VersionEntry> {
        Channel::ALL.into_iter().find_map(|channel| {
            self.entries(channel)
                .iter()
                .find(|entry| entry.build() == build)
                .cloned()
        })
    }

    /// Refresh a single channel. On failure the previous list stays visible.
    pub async fn refresh(
        &self,
        client: &ManifestClient,
        channel: Channel,
    ) -> Result<usize, UpdateError> {
        match client.fetch(channel).await {
            Ok(entries) => {
                let count = entries.len();
                self.replace(channel, entries);
                info!("manifest: refreshed {channel} ({count} entries)");
                Ok(count)
            }
            Err(err) => {
                warn!(
                    "manifest: refresh of {channel} failed, keeping {} cached entries: {err}",
                    self.entries(channel).len()
                );
                Err(err)
            }
        }
    }

    /// Refresh all channels concurrently and mark the store ready.
    pub async fn refresh_all(&self, client: &ManifestClient) -> RefreshReport {
        let results = join_all(Channel::ALL.into_iter().map(|channel| async move {
            (channel, self.refresh(client, channel).await)
        }))
        .await;
        self.ready.send_replace(true);
        RefreshReport { results }
    }

    /// Run the initial refresh in the background; the handle yields its report.
    ///
    /// The store becomes ready even if the task panics or is aborted.
    pub fn spawn_initial_refresh(
        self: &Arc<Self>,
        client: ManifestClient,
    ) -> JoinHandle<RefreshReport> {
        let guard = ReadyOnDrop(Arc::clone(self));
        tokio::spawn(async move {
            let store = &guard.0;
            store.refresh_all(&client).await
        })
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the first full refresh has finished, whatever its outcome.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

/// Marks the store ready when the initial refresh task ends, however it ends.
struct ReadyOnDrop(Arc<ManifestStore>);

impl Drop for ReadyOnDrop {
    fn drop(&mut self) {
        self.0.ready.send_replace(true);
    }
}
