use std::path::Path;
use std::process::{Child, Command, Stdio};

use log::{debug, info, warn};
use sysinfo::System;

use crate::engine::UpdateCoordinator;
use crate::error::LaunchError;
use crate::jre::{RuntimeKind, RuntimeManager};
use crate::manifest::VersionEntry;
use crate::storage::{self, GAME_JAR, LaunchSettings};

/// Smallest heap the game is started with, in MB.
pub const MIN_MEMORY_MB: u32 = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchOptions {
    pub memory_mb: u32,
    pub launch_args: String,
    pub server: bool,
}

impl LaunchOptions {
    pub fn from_settings(settings: &LaunchSettings, server: bool) -> Self {
        Self {
            memory_mb: settings.memory,
            launch_args: settings.launch_args.clone(),
            server,
        }
    }
}

/// Starts the installed game with the runtime its version needs.
#[derive(Clone)]
pub struct LaunchSupervisor {
    runtimes: RuntimeManager,
    coordinator: UpdateCoordinator,
}

impl LaunchSupervisor {
    pub fn new(runtimes: RuntimeManager, coordinator: UpdateCoordinator) -> Self {
        Self {
            runtimes,
            coordinator,
        }
    }

    /// Spawn the game and return without waiting for it.
    pub async fn launch(
        &self,
        install_dir: &Path,
        installed: Option<&VersionEntry>,
        options: &LaunchOptions,
    ) -> Result<Child, LaunchError> {
        let entry = installed.ok_or(LaunchError::NotInstalled)?;
        if self.coordinator.is_active(install_dir) {
            warn!("launch: update running for {}", install_dir.display());
            return Err(LaunchError::UpdateInProgress);
        }
        let jar = storage::game_jar_path(install_dir);
        if !jar.exists() {
            warn!("launch: game not found at {}", jar.display());
            return Err(LaunchError::GameMissing(jar.display().to_string()));
        }

        let kind = RuntimeKind::for_version(entry.version());
        let java = self
            .runtimes
            .ensure(kind, None)
            .await
            .map_err(|e| LaunchError::Runtime(e.to_string()))?;

        let memory = clamp_memory(options.memory_mb, system_memory_mb());
        if memory != options.memory_mb {
            warn!(
                "launch: memory {} MB out of range, using {memory} MB",
                options.memory_mb
            );
        }
        let args = build_args(memory, &options.launch_args, options.server);
        info!(
            "launch: starting {entry} with {} ({})",
            kind.dir_name(),
            if options.server { "server" } else { "client" }
        );
        debug!("launch: {} {}", java.display(), args.join(" "));

        let child = command(&java, install_dir, &args)
            .spawn()
            .map_err(|e| LaunchError::Spawn(e.to_string()))?;
        info!("launch: process {} started", child.id());
        Ok(child)
    }
}

/// JVM and game arguments, in order.
pub fn build_args(memory_mb: u32, launch_args: &str, server: bool) -> Vec<String> {
    let mut args = vec![
        format!("-Xms{MIN_MEMORY_MB}m"),
        format!("-Xmx{memory_mb}m"),
    ];
    args.extend(launch_args.split_whitespace().map(str::to_owned));
    args.push("-jar".into());
    args.push(GAME_JAR.into());
    args.push(if server { "-server" } else { "-force" }.into());
    args
}

/// Keep the heap between the minimum and the machine's physical memory.
pub fn clamp_memory(requested_mb: u32, system_mb: Option<u32>) -> u32 {
    let upper = system_mb.unwrap_or(u32::MAX).max(MIN_MEMORY_MB);
    requested_mb.clamp(MIN_MEMORY_MB, upper)
}

fn system_memory_mb() -> Option<u32> {
    let mut system = System::new();
    system.refresh_memory();
    let total_mb = system.total_memory() / (1024 * 1024);
    (total_mb > 0).then(|| u32::try_from(total_mb).unwrap_or(u32::MAX))
}

fn command(java: &Path, install_dir: &Path, args: &[String]) -> Command {
    let mut cmd = Command::new(java);
    cmd.args(args)
        .current_dir(install_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    cmd
}
