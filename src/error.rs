use std::path::Path;

use thiserror::Error;

use crate::manifest::Channel;

/// Everything that can stop a manifest refresh or an update run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("network error during {context}: {details}")]
    Network {
        context: &'static str,
        details: String,
    },

    #[error("malformed {channel} manifest line {line}: {reason}")]
    Parse {
        channel: Channel,
        line: usize,
        reason: String,
    },

    #[error("backup failed ({context}): {details}")]
    Backup {
        context: &'static str,
        details: String,
    },

    #[error("install failed ({context}): {details}")]
    Apply {
        context: &'static str,
        details: String,
    },

    #[error("no {channel} versions available")]
    VersionNotFound { channel: Channel },

    #[error("update cancelled")]
    Cancelled,

    #[error("an update is already running for {install_dir}")]
    AlreadyRunning { install_dir: String },

    #[error("settings error ({context}): {details}")]
    Settings {
        context: &'static str,
        details: String,
    },
}

impl UpdateError {
    pub fn network(context: &'static str, error: impl std::fmt::Display) -> Self {
        Self::Network {
            context,
            details: error.to_string(),
        }
    }

    pub fn backup(context: &'static str, error: impl std::fmt::Display) -> Self {
        Self::Backup {
            context,
            details: error.to_string(),
        }
    }

    pub fn backup_at(context: &'static str, path: &Path, error: impl std::fmt::Display) -> Self {
        Self::backup(context, format!("{}: {error}", path.display()))
    }

    pub fn apply(context: &'static str, error: impl std::fmt::Display) -> Self {
        Self::Apply {
            context,
            details: error.to_string(),
        }
    }

    pub fn apply_at(context: &'static str, path: &Path, error: impl std::fmt::Display) -> Self {
        Self::apply(context, format!("{}: {error}", path.display()))
    }

    pub fn settings(context: &'static str, error: impl std::fmt::Display) -> Self {
        Self::Settings {
            context,
            details: error.to_string(),
        }
    }

    /// Short machine-friendly tag, used in logs and the failed run state.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Parse { .. } => "parse",
            Self::Backup { .. } => "backup",
            Self::Apply { .. } => "apply",
            Self::VersionNotFound { .. } => "version-not-found",
            Self::Cancelled => "cancelled",
            Self::AlreadyRunning { .. } => "already-running",
            Self::Settings { .. } => "settings",
        }
    }
}

/// Failures starting the installed program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("no installed version could be resolved")]
    NotInstalled,

    #[error("game not found at {0}")]
    GameMissing(String),

    #[error("an update is running for this install directory")]
    UpdateInProgress,

    #[error("runtime unavailable: {0}")]
    Runtime(String),

    #[error("failed to start game process: {0}")]
    Spawn(String),
}
