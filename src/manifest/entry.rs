use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::UpdateError;

/// Independent release track, each with its own build index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Release,
    Dev,
    Pre,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Release, Channel::Dev, Channel::Pre];

    /// File name of the channel's index on the build server.
    #[must_use]
    pub fn index_name(self) -> &'static str {
        match self {
            Channel::Release => "releasebuildindex",
            Channel::Dev => "devbuildindex",
            Channel::Pre => "prebuildindex",
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Channel::Release => "Release",
            Channel::Dev => "Dev",
            Channel::Pre => "Pre-Release",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Release => "release",
            Channel::Dev => "dev",
            Channel::Pre => "pre",
        })
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "release" => Ok(Channel::Release),
            "dev" => Ok(Channel::Dev),
            "pre" | "prerelease" | "pre-release" => Ok(Channel::Pre),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

/// One record of a channel index: `version#build path`.
///
/// Identity is `(channel, build, path)`; the version token only takes part in ordering.
#[derive(Clone, Debug)]
pub struct VersionEntry {
    build: String,
    path: String,
    version: String,
    channel: Channel,
}

impl VersionEntry {
    pub fn new(
        channel: Channel,
        version: impl Into<String>,
        build: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            build: build.into(),
            path: path.into(),
            version: version.into(),
            channel,
        }
    }

    /// Parse a single index line for `channel`. `line_no` is 1-based and only used for errors.
    pub fn parse_line(channel: Channel, line_no: usize, line: &str) -> Result<Self, UpdateError> {
        let parse_error = |reason: &str| UpdateError::Parse {
            channel,
            line: line_no,
            reason: reason.to_owned(),
        };

        let line = line.strip_suffix('\r').unwrap_or(line);
        let (token, path) = line
            .split_once(' ')
            .ok_or_else(|| parse_error("expected '<version>#<build> <path>'"))?;
        let (version, build) = token
            .split_once('#')
            .ok_or_else(|| parse_error("missing '#' between version and build"))?;

        if version.is_empty() {
            return Err(parse_error("empty version token"));
        }
        if build.is_empty() {
            return Err(parse_error("empty build token"));
        }
        if path.is_empty() {
            return Err(parse_error("empty path"));
        }

        Ok(Self::new(channel, version, build, path))
    }

    /// Serialise back into index line form.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{}#{} {}", self.version, self.build, self.path)
    }

    pub fn build(&self) -> &str {
        &self.build
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// True when an installed-version marker names this entry.
    #[must_use]
    pub fn matches_marker(&self, marker: &str) -> bool {
        marker.contains(&self.build) && marker.contains(&self.path)
    }
}

impl PartialEq for VersionEntry {
    fn eq(&self, other: &Self) -> bool {
        self.channel == other.channel && self.build == other.build && self.path == other.path
    }
}

impl Eq for VersionEntry {}

impl Hash for VersionEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.channel.hash(state);
        self.build.hash(state);
        self.path.hash(state);
    }
}

impl fmt::Display for VersionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.version, self.build, self.channel)
    }
}

/// Compare two dotted version tokens.
///
/// Components are compared left to right: both numeric compare as numbers, otherwise as
/// strings, and a numeric component sorts before a non-numeric one. A missing component
/// counts as `0`, so `0.1` equals `0.1.0`.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts_a: Vec<&str> = a.trim().split('.').collect();
    let parts_b: Vec<&str> = b.trim().split('.').collect();
    let max_len = parts_a.len().max(parts_b.len());

    for i in 0..max_len {
        let a_part = parts_a.get(i).copied().unwrap_or("0");
        let b_part = parts_b.get(i).copied().unwrap_or("0");
        let ordering = match (a_part.parse::<u64>(), b_part.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => a_part.cmp(b_part),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    Ordering::Equal
}

/// Total order over entries, oldest first: version, then build, then path.
#[must_use]
pub fn compare_entries(a: &VersionEntry, b: &VersionEntry) -> Ordering {
    compare_versions(&a.version, &b.version)
        .then_with(|| a.build.cmp(&b.build))
        .then_with(|| a.path.cmp(&b.path))
}

/// Sort so that index 0 is the newest entry.
pub fn sort_newest_first(entries: &mut [VersionEntry]) {
    entries.sort_by(|a, b| compare_entries(b, a));
}
