//! Update and launch core for the StarMade game: channel manifests, backups, staged installs
//! and process launch.

pub mod backup;
pub mod engine;
pub mod env;
pub mod error;
pub mod installer;
pub mod jre;
pub mod manifest;
pub mod networking;
pub mod process;
pub mod session;
pub mod storage;
pub mod util;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{LaunchError, UpdateError};
