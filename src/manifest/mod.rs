use log::{debug, info};
use reqwest::Client;

use crate::error::UpdateError;
use crate::networking;

pub mod entry;
pub mod store;

pub use entry::{Channel, VersionEntry, compare_entries, compare_versions, sort_newest_first};
pub use store::{ManifestStore, RefreshReport};

const BUILD_HOST: &str = "http://files.star-made.org";
/// Identifies the launcher to the build host.
pub const LAUNCHER_USER_AGENT: &str = "StarMade-Updater_3";

/// Where channel indexes and build artifacts are served from.
#[derive(Clone, Debug)]
pub struct ManifestSource {
    pub index_base: String,
    pub artifact_base: String,
    pub user_agent: String,
}

impl Default for ManifestSource {
    fn default() -> Self {
        Self {
            index_base: BUILD_HOST.into(),
            artifact_base: BUILD_HOST.into(),
            user_agent: LAUNCHER_USER_AGENT.into(),
        }
    }
}

impl ManifestSource {
    /// Serve both indexes and artifacts from one base URL.
    pub fn with_base(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            index_base: base.clone(),
            artifact_base: base,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn index_url(&self, channel: Channel) -> String {
        format!(
            "{}/{}",
            self.index_base.trim_end_matches('/'),
            channel.index_name()
        )
    }

    /// Remote location of an entry's archive. Absolute paths are used verbatim.
    #[must_use]
    pub fn artifact_url(&self, entry: &VersionEntry) -> String {
        let path = entry.path();
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_owned();
        }
        let relative = path.trim_start_matches("./").trim_start_matches('/');
        format!("{}/{}", self.artifact_base.trim_end_matches('/'), relative)
    }
}

/// Fetches and parses the per-channel build index.
#[derive(Clone)]
pub struct ManifestClient {
    client: Client,
    source: ManifestSource,
}

impl ManifestClient {
    pub fn new(source: ManifestSource) -> Self {
        let client = networking::build_client(&source.user_agent);
        Self { client, source }
    }

    pub fn source(&self) -> &ManifestSource {
        &self.source
    }

    /// Download one channel's index and return its entries, newest first.
    ///
    /// The whole body is read before any line is parsed; a single malformed line fails the
    /// channel.
    pub async fn fetch(&self, channel: Channel) -> Result<Vec<VersionEntry>, UpdateError> {
        let url = self.source.index_url(channel);
        debug!("manifest: requesting {url}");
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| UpdateError::network("manifest request", e))?
            .error_for_status()
            .map_err(|e| UpdateError::network("manifest status", e))?
            .bytes()
            .await
            .map_err(|e| UpdateError::network("manifest body", e))?;

        let body = decode_index(channel, body.to_vec())?;
        let entries = parse_index(channel, &body)?;
        info!("manifest: parsed {} {} entries", entries.len(), channel);
        Ok(entries)
    }
}

/// Index bodies must be UTF-8. The error names the line holding the first bad byte.
fn decode_index(channel: Channel, body: Vec<u8>) -> Result<String, UpdateError> {
    String::from_utf8(body).map_err(|err| {
        let valid = err.utf8_error().valid_up_to();
        let line = err.as_bytes()[..valid]
            .iter()
            .filter(|&&b| b == b'\n')
            .count()
            + 1;
        UpdateError::Parse {
            channel,
            line,
            reason: "invalid UTF-8".into(),
        }
    })
}

/// Parse a complete index body. Blank lines are ignored; any other line must be well formed.
pub fn parse_index(channel: Channel, body: &str) -> Result<Vec<VersionEntry>, UpdateError> {
    let mut entries = Vec::new();
    for (idx, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        entries.push(VersionEntry::parse_line(channel, idx + 1, line)?);
    }
    sort_newest_first(&mut entries);
    Ok(entries)
}
