use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};

use sm_launcher::backup::BackupScope;
use sm_launcher::engine::{ChannelListener, UpdateCoordinator, UpdateEvent, UpdateProgress};
use sm_launcher::env;
use sm_launcher::jre::RuntimeManager;
use sm_launcher::manifest::{Channel, ManifestClient, ManifestSource, ManifestStore};
use sm_launcher::process::{LaunchOptions, LaunchSupervisor};
use sm_launcher::session::Session;
use sm_launcher::storage::SettingsStore;

#[derive(Parser, Debug)]
#[command(
    name = "sm-launcher",
    author,
    version,
    about = "Headless StarMade updater and launcher"
)]
struct Cli {
    /// Release channel to update from. Defaults to the installed version's channel.
    #[arg(long)]
    channel: Option<Channel>,

    /// Install a specific build instead of the channel's newest.
    #[arg(long)]
    build: Option<String>,

    /// What to back up before updating: none, database or everything.
    #[arg(long, default_value = "database")]
    backup: BackupScope,

    /// Game install directory. Saved to the launcher settings.
    #[arg(long)]
    install_dir: Option<PathBuf>,

    /// Reinstall even if the selected version is already installed.
    #[arg(long)]
    force: bool,

    /// Print every channel's versions and exit.
    #[arg(long)]
    list: bool,

    /// Start the game after updating.
    #[arg(long)]
    launch: bool,

    /// Start a dedicated server after updating.
    #[arg(long)]
    server: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    if let Err(err) = env::ensure_base_dirs() {
        warn!("unable to create launcher directories: {err}");
    }

    let settings_store = SettingsStore::default();
    let mut settings = settings_store.load().await?;

    let manifests = Arc::new(ManifestStore::new());
    let client = ManifestClient::new(ManifestSource::default());
    let report = manifests.spawn_initial_refresh(client).await?;
    for (channel, err) in report.failures() {
        warn!("{channel} versions unavailable: {err}");
    }

    let coordinator = UpdateCoordinator::default();
    let mut session = Session::from_settings(&settings, Arc::clone(&manifests));
    if let Some(dir) = cli.install_dir {
        session.set_install_dir(dir);
    }
    match session.resolve_installed().await {
        Some(entry) => println!("Installed: {entry}"),
        None => println!("Installed: none"),
    }
    if let Some(channel) = cli.channel {
        session.select_channel(channel);
    }
    if let Some(build) = &cli.build {
        session.select_build(build)?;
    }

    if cli.list {
        print_versions(&manifests);
        return Ok(());
    }

    if cli.force || !session.is_up_to_date() {
        update(&coordinator, &mut session, cli.backup).await?;
        if let Some(entry) = session.installed() {
            settings.last_used_version = entry.build().to_owned();
        }
    } else {
        println!("Already up to date ({})", session.channel());
    }
    settings.install_dir = session.install_dir().to_path_buf();
    settings_store.save(&settings).await?;

    if cli.launch || cli.server {
        let supervisor = LaunchSupervisor::new(RuntimeManager::default(), coordinator);
        let child = supervisor
            .launch(
                session.install_dir(),
                session.installed(),
                &LaunchOptions::from_settings(&settings, cli.server),
            )
            .await?;
        println!("Started StarMade (pid {})", child.id());
    }
    Ok(())
}

async fn update(
    coordinator: &UpdateCoordinator,
    session: &mut Session,
    scope: BackupScope,
) -> Result<(), Box<dyn Error>> {
    let request = session.update_request(scope)?;
    println!("Updating to {}", request.entry);

    let (listener, mut events) = ChannelListener::channel();
    let handle = coordinator.start(request, listener)?;

    let mut bar = UpdateBar::new(ProgressBar::new(1000));
    while let Some(event) = events.recv().await {
        match event {
            UpdateEvent::State(state) => bar.set_message(state.label()),
            UpdateEvent::Progress(progress) => bar.show(progress),
            UpdateEvent::Finished(_) | UpdateEvent::Failed(_) => break,
        }
    }
    bar.finish();

    let entry = handle.wait().await.into_result()?;
    info!("updated to {entry}");
    println!("Installed {entry}");
    session.mark_installed(entry);
    Ok(())
}

/// Overall progress bar that turns into a spinner while the download size is unknown.
struct UpdateBar {
    bar: ProgressBar,
    progress: Option<ProgressStyle>,
    spinner: Option<ProgressStyle>,
    spinning: bool,
}

impl UpdateBar {
    fn new(bar: ProgressBar) -> Self {
        let progress = ProgressStyle::with_template("  {msg:12} [{bar:30}] {percent:>3}%").ok();
        let spinner = ProgressStyle::with_template("  {msg:12} {spinner}").ok();
        if let Some(style) = &progress {
            bar.set_style(style.clone());
        }
        Self {
            bar,
            progress,
            spinner,
            spinning: false,
        }
    }

    fn set_message(&self, message: &'static str) {
        self.bar.set_message(message);
    }

    fn show(&mut self, progress: UpdateProgress) {
        match progress {
            UpdateProgress::Fraction(f) => {
                if self.spinning {
                    self.bar.disable_steady_tick();
                    if let Some(style) = &self.progress {
                        self.bar.set_style(style.clone());
                    }
                    self.spinning = false;
                }
                self.bar.set_position((f * 1000.0) as u64);
            }
            UpdateProgress::Indeterminate => {
                if !self.spinning {
                    if let Some(style) = &self.spinner {
                        self.bar.set_style(style.clone());
                    }
                    self.bar.enable_steady_tick(Duration::from_millis(100));
                    self.spinning = true;
                }
            }
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

fn print_versions(manifests: &ManifestStore) {
    for channel in Channel::ALL {
        println!("{}:", channel.label());
        for (i, entry) in manifests.entries(channel).iter().enumerate() {
            let latest = if i == 0 { " (Latest)" } else { "" };
            println!("  {} {}{latest}", entry.version(), entry.build());
        }
    }
}
