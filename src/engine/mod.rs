use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};

use crate::backup::{BackupManager, BackupOutcome, BackupScope};
use crate::env;
use crate::error::UpdateError;
use crate::installer::{ApplyReport, Installer};
use crate::manifest::{ManifestSource, VersionEntry};
use crate::networking::ArtifactFetcher;

pub mod state;

pub use state::{ProgressTracker, ProgressWeights, RunState, UpdateProgress};

/// One update to perform: bring `install_dir` to `entry`, backing up `scope` first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateRequest {
    pub install_dir: PathBuf,
    pub entry: VersionEntry,
    pub scope: BackupScope,
}

/// Receives a run's progress and its single terminal result.
///
/// Called from the run's background task; implementors marshal onto their own thread if needed.
pub trait UpdateListener: Send + 'static {
    fn on_state(&mut self, _state: &RunState) {}
    fn on_progress(&mut self, progress: UpdateProgress);
    fn on_finished(&mut self, entry: &VersionEntry);
    fn on_error(&mut self, error: &UpdateError);
}

#[derive(Clone, Debug, PartialEq)]
pub enum UpdateEvent {
    State(RunState),
    Progress(UpdateProgress),
    Finished(VersionEntry),
    Failed(UpdateError),
}

/// Forwards listener calls over an unbounded channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<UpdateEvent>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::UnboundedSender<UpdateEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UpdateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl UpdateListener for ChannelListener {
    fn on_state(&mut self, state: &RunState) {
        self.tx.send(UpdateEvent::State(state.clone())).ok();
    }

    fn on_progress(&mut self, progress: UpdateProgress) {
        self.tx.send(UpdateEvent::Progress(progress)).ok();
    }

    fn on_finished(&mut self, entry: &VersionEntry) {
        self.tx.send(UpdateEvent::Finished(entry.clone())).ok();
    }

    fn on_error(&mut self, error: &UpdateError) {
        self.tx.send(UpdateEvent::Failed(error.clone())).ok();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Finished(VersionEntry),
    Failed(UpdateError),
}

impl RunOutcome {
    pub fn into_result(self) -> Result<VersionEntry, UpdateError> {
        match self {
            RunOutcome::Finished(entry) => Ok(entry),
            RunOutcome::Failed(err) => Err(err),
        }
    }
}

struct RunShared {
    id: u64,
    state: Mutex<RunState>,
    cancel: Arc<AtomicBool>,
}

impl RunShared {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(RunState::Idle),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> RunState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn is_active(&self) -> bool {
        !self.state().is_terminal()
    }
}

/// Listener plus progress bookkeeping, shared with blocking steps.
struct Reporter {
    listener: Box<dyn UpdateListener>,
    tracker: ProgressTracker,
}

type SharedReporter = Arc<Mutex<Reporter>>;

fn report(reporter: &SharedReporter, step: &RunState, fraction: Option<f32>) {
    let mut guard = reporter.lock().unwrap_or_else(PoisonError::into_inner);
    let progress = guard.tracker.report(step, fraction);
    guard.listener.on_progress(progress);
}

/// Handle to a started run.
pub struct RunHandle {
    install_dir: PathBuf,
    shared: Arc<RunShared>,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Ask the run to stop at its next checkpoint.
    pub fn cancel(&self) {
        warn!("update: cancel requested for {}", self.install_dir.display());
        self.shared.cancel.store(true, Ordering::SeqCst);
    }

    pub fn state(&self) -> RunState {
        self.shared.state()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> RunOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("update: run task for {} aborted: {err}", self.install_dir.display());
                RunOutcome::Failed(UpdateError::apply("join update task", err))
            }
        }
    }
}

struct CoordinatorInner {
    source: ManifestSource,
    backups: BackupManager,
    fetcher: ArtifactFetcher,
    installer: Installer,
    download_dir: PathBuf,
    next_run: AtomicU64,
    runs: Mutex<HashMap<PathBuf, Arc<RunShared>>>,
}

/// Runs Backup, Fetch and Apply as one cancellable unit of work per install directory.
#[derive(Clone)]
pub struct UpdateCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Default for UpdateCoordinator {
    fn default() -> Self {
        Self::new(
            ManifestSource::default(),
            BackupManager::default(),
            env::cache_dir().join("artifacts"),
        )
    }
}

impl UpdateCoordinator {
    pub fn new(source: ManifestSource, backups: BackupManager, download_dir: impl Into<PathBuf>) -> Self {
        let fetcher = ArtifactFetcher::new(&source.user_agent);
        Self {
            inner: Arc::new(CoordinatorInner {
                source,
                backups,
                fetcher,
                installer: Installer::new(),
                download_dir: download_dir.into(),
                next_run: AtomicU64::new(1),
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Whether a run for `install_dir` has started and not yet reached a terminal state.
    pub fn is_active(&self, install_dir: &Path) -> bool {
        let key = run_key(install_dir);
        self.inner
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .is_some_and(|run| run.is_active())
    }

    /// Start a run on the current tokio runtime.
    ///
    /// Fails with `AlreadyRunning`, without touching the listener, when a run for the same
    /// install directory is still active.
    pub fn start(
        &self,
        request: UpdateRequest,
        listener: impl UpdateListener,
    ) -> Result<RunHandle, UpdateError> {
        let key = run_key(&request.install_dir);
        let shared = {
            let mut runs = self.inner.runs.lock().unwrap_or_else(PoisonError::into_inner);
            if runs.get(&key).is_some_and(|run| run.is_active()) {
                warn!(
                    "update: refusing second run for {}",
                    request.install_dir.display()
                );
                return Err(UpdateError::AlreadyRunning {
                    install_dir: request.install_dir.display().to_string(),
                });
            }
            let id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
            let shared = Arc::new(RunShared::new(id));
            runs.insert(key.clone(), Arc::clone(&shared));
            shared
        };

        info!(
            "update: starting run for {} -> {} (backup {})",
            request.install_dir.display(),
            request.entry,
            request.scope
        );
        let reporter = Arc::new(Mutex::new(Reporter {
            listener: Box::new(listener),
            tracker: ProgressTracker::new(ProgressWeights::for_scope(request.scope)),
        }));
        let install_dir = request.install_dir.clone();
        let inner = Arc::clone(&self.inner);
        let run_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            let result = inner.drive(&request, &run_shared, &reporter).await;
            inner.finish(&key, &run_shared, &reporter, &request.entry, result)
        });

        Ok(RunHandle {
            install_dir,
            shared,
            task,
        })
    }
}

impl CoordinatorInner {
    fn enter(&self, shared: &RunShared, reporter: &SharedReporter, state: RunState) {
        info!("update: -> {state}");
        shared.set_state(state.clone());
        let mut guard = reporter.lock().unwrap_or_else(PoisonError::into_inner);
        guard.listener.on_state(&state);
    }

    async fn drive(
        &self,
        request: &UpdateRequest,
        shared: &RunShared,
        reporter: &SharedReporter,
    ) -> Result<ApplyReport, UpdateError> {
        let cancel = Some(Arc::clone(&shared.cancel));
        checkpoint(shared)?;

        self.enter(shared, reporter, RunState::BackingUp);
        report(reporter, &RunState::BackingUp, Some(0.0));
        let backups = self.backups.clone();
        let install_dir = request.install_dir.clone();
        let scope = request.scope;
        let outcome = task::spawn_blocking(move || backups.backup(&install_dir, scope))
            .await
            .map_err(|e| UpdateError::backup("join backup task", e))??;
        match &outcome {
            BackupOutcome::Created(dest) => info!("update: backup written to {}", dest.display()),
            BackupOutcome::Skipped => debug!("update: no backup taken"),
        }
        report(reporter, &RunState::BackingUp, Some(1.0));
        checkpoint(shared)?;

        let archive = self
            .download_dir
            .join(download_name(&request.entry, shared.id));
        let result = self
            .download_and_apply(request, &archive, cancel, reporter, shared)
            .await;
        discard_download(&archive).await;
        result
    }

    async fn download_and_apply(
        &self,
        request: &UpdateRequest,
        archive: &Path,
        cancel: Option<Arc<AtomicBool>>,
        reporter: &SharedReporter,
        shared: &RunShared,
    ) -> Result<ApplyReport, UpdateError> {
        self.enter(shared, reporter, RunState::Downloading);
        let url = self.source.artifact_url(&request.entry);
        let step = RunState::Downloading;
        self.fetcher
            .fetch(&url, archive, cancel.clone(), |p| {
                debug!(
                    "update: downloaded {} of {:?} bytes",
                    p.downloaded, p.total
                );
                report(reporter, &step, p.fraction());
            })
            .await?;
        report(reporter, &step, Some(1.0));
        checkpoint(shared)?;

        self.enter(shared, reporter, RunState::Applying);
        let installer = self.installer.clone();
        let archive = archive.to_path_buf();
        let install_dir = request.install_dir.clone();
        let entry = request.entry.clone();
        let progress = Arc::clone(reporter);
        task::spawn_blocking(move || {
            let step = RunState::Applying;
            installer.apply(&archive, &install_dir, &entry, cancel, |done, total| {
                let fraction = if total == 0 {
                    1.0
                } else {
                    done as f32 / total as f32
                };
                report(&progress, &step, Some(fraction));
            })
        })
        .await
        .map_err(|e| UpdateError::apply("join apply task", e))?
    }

    /// Move the run to its terminal state, then notify the listener exactly once.
    fn finish(
        &self,
        key: &Path,
        shared: &Arc<RunShared>,
        reporter: &SharedReporter,
        entry: &VersionEntry,
        result: Result<ApplyReport, UpdateError>,
    ) -> RunOutcome {
        let outcome = match result {
            Ok(applied) => {
                info!(
                    "update: {} updated to {entry} ({} files)",
                    applied.install_dir.display(),
                    applied.files_written
                );
                report(reporter, &RunState::Finished, Some(1.0));
                self.enter(shared, reporter, RunState::Finished);
                RunOutcome::Finished(entry.clone())
            }
            Err(err) => {
                error!("update: run failed: {err}");
                self.enter(shared, reporter, RunState::Failed(err.clone()));
                RunOutcome::Failed(err)
            }
        };

        {
            let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
            if runs.get(key).is_some_and(|run| Arc::ptr_eq(run, shared)) {
                runs.remove(key);
            }
        }

        let mut guard = reporter.lock().unwrap_or_else(PoisonError::into_inner);
        match &outcome {
            RunOutcome::Finished(entry) => guard.listener.on_finished(entry),
            RunOutcome::Failed(err) => guard.listener.on_error(err),
        }
        outcome
    }
}

fn checkpoint(shared: &RunShared) -> Result<(), UpdateError> {
    if shared.cancel.load(Ordering::SeqCst) {
        return Err(UpdateError::Cancelled);
    }
    Ok(())
}

fn run_key(install_dir: &Path) -> PathBuf {
    std::path::absolute(install_dir).unwrap_or_else(|_| install_dir.to_path_buf())
}

/// Archive file name for one run. Concurrent runs of the same build never share a file.
fn download_name(entry: &VersionEntry, run_id: u64) -> String {
    let build: String = entry
        .build()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "{}-{build}-{}-{run_id}.zip",
        entry.channel(),
        std::process::id()
    )
}

async fn discard_download(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("update: removed download {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("update: could not remove {}: {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Channel;
    use crate::storage;
    use crate::test_support::{serve_chunked, snapshot, zip_bytes};
    use std::fs;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        _work: tempfile::TempDir,
        install: PathBuf,
        backups: PathBuf,
        downloads: PathBuf,
        coordinator: UpdateCoordinator,
    }

    fn fixture(server: &MockServer) -> Fixture {
        let work = tempfile::tempdir().unwrap();
        let install = work.path().join("StarMade");
        let backups = work.path().join("backups");
        let downloads = work.path().join("downloads");
        let coordinator = UpdateCoordinator::new(
            ManifestSource::with_base(server.uri()),
            BackupManager::new(&backups),
            &downloads,
        );
        Fixture {
            _work: work,
            install,
            backups,
            downloads,
            coordinator,
        }
    }

    fn entry() -> VersionEntry {
        VersionEntry::new(Channel::Release, "0.302", "20230411_1", "./build/b1")
    }

    async fn serve_artifact(server: &MockServer, files: &[(&str, &[u8])]) {
        Mock::given(method("GET"))
            .and(path("/build/b1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(zip_bytes(files)))
            .mount(server)
            .await;
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UpdateEvent>) -> Vec<UpdateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn fractions(events: &[UpdateEvent]) -> Vec<f32> {
        events
            .iter()
            .filter_map(|e| match e {
                UpdateEvent::Progress(UpdateProgress::Fraction(f)) => Some(*f),
                _ => None,
            })
            .collect()
    }

    fn terminal_events(events: &[UpdateEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, UpdateEvent::Finished(_) | UpdateEvent::Failed(_)))
            .count()
    }

    fn no_files(dir: &Path) -> bool {
        !dir.exists() || snapshot(dir).is_empty()
    }

    #[tokio::test]
    async fn fresh_install_completes_and_writes_marker() {
        let server = MockServer::start().await;
        serve_artifact(&server, &[("StarMade.jar", b"jar"), ("data/a.cfg", b"a")]).await;
        let fx = fixture(&server);
        let (listener, mut rx) = ChannelListener::channel();

        let handle = fx
            .coordinator
            .start(
                UpdateRequest {
                    install_dir: fx.install.clone(),
                    entry: entry(),
                    scope: BackupScope::None,
                },
                listener,
            )
            .unwrap();
        let outcome = handle.wait().await;

        assert_eq!(outcome, RunOutcome::Finished(entry()));
        let marker = storage::read_marker(&fx.install).await.unwrap();
        assert!(entry().matches_marker(&marker));
        assert_eq!(fs::read(fx.install.join("StarMade.jar")).unwrap(), b"jar");
        assert!(no_files(&fx.downloads));
        assert!(!fx.backups.exists());
        assert!(!fx.coordinator.is_active(&fx.install));

        let events = drain(&mut rx);
        let states: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                UpdateEvent::State(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                RunState::BackingUp,
                RunState::Downloading,
                RunState::Applying,
                RunState::Finished
            ]
        );
        let progress = fractions(&events);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&1.0));
        assert_eq!(terminal_events(&events), 1);
        assert_eq!(events.last(), Some(&UpdateEvent::Finished(entry())));
    }

    #[tokio::test]
    async fn unknown_download_size_is_indeterminate() {
        let base = serve_chunked(zip_bytes(&[("StarMade.jar", b"jar")])).await;
        let work = tempfile::tempdir().unwrap();
        let install = work.path().join("StarMade");
        let coordinator = UpdateCoordinator::new(
            ManifestSource::with_base(base),
            BackupManager::new(work.path().join("backups")),
            work.path().join("downloads"),
        );
        let (listener, mut rx) = ChannelListener::channel();

        let outcome = coordinator
            .start(
                UpdateRequest {
                    install_dir: install.clone(),
                    entry: entry(),
                    scope: BackupScope::None,
                },
                listener,
            )
            .unwrap()
            .wait()
            .await;

        assert_eq!(outcome, RunOutcome::Finished(entry()));
        assert_eq!(fs::read(install.join("StarMade.jar")).unwrap(), b"jar");
        let events = drain(&mut rx);
        assert!(events.contains(&UpdateEvent::Progress(UpdateProgress::Indeterminate)));
        let progress = fractions(&events);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&1.0));
    }

    #[tokio::test]
    async fn existing_install_is_backed_up_before_apply() {
        let server = MockServer::start().await;
        serve_artifact(&server, &[("StarMade.jar", b"new")]).await;
        let fx = fixture(&server);
        fs::create_dir_all(fx.install.join("server-database")).unwrap();
        fs::write(fx.install.join("StarMade.jar"), b"old").unwrap();
        fs::write(fx.install.join("server-database/world.db"), b"db").unwrap();
        let (listener, _rx) = ChannelListener::channel();

        let outcome = fx
            .coordinator
            .start(
                UpdateRequest {
                    install_dir: fx.install.clone(),
                    entry: entry(),
                    scope: BackupScope::DatabaseOnly,
                },
                listener,
            )
            .unwrap()
            .wait()
            .await;

        assert!(matches!(outcome, RunOutcome::Finished(_)));
        assert_eq!(fs::read(fx.install.join("StarMade.jar")).unwrap(), b"new");
        assert_eq!(fs::read(fx.install.join("server-database/world.db")).unwrap(), b"db");
        let backed_up = snapshot(&fx.backups);
        assert_eq!(backed_up.len(), 1);
        assert!(backed_up.values().all(|bytes| bytes == b"db"));
    }

    #[tokio::test]
    async fn network_failure_reports_error_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/build/b1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let fx = fixture(&server);
        fs::create_dir_all(&fx.install).unwrap();
        fs::write(fx.install.join("StarMade.jar"), b"old").unwrap();
        let before = snapshot(&fx.install);
        let (listener, mut rx) = ChannelListener::channel();

        let handle = fx
            .coordinator
            .start(
                UpdateRequest {
                    install_dir: fx.install.clone(),
                    entry: entry(),
                    scope: BackupScope::None,
                },
                listener,
            )
            .unwrap();
        let outcome = handle.wait().await;

        let RunOutcome::Failed(err) = outcome else {
            panic!("run should fail");
        };
        assert!(matches!(err, UpdateError::Network { .. }));
        let events = drain(&mut rx);
        assert_eq!(terminal_events(&events), 1);
        assert!(events.iter().all(|e| !matches!(e, UpdateEvent::Finished(_))));
        assert!(events.contains(&UpdateEvent::State(RunState::Failed(err))));
        assert_eq!(snapshot(&fx.install), before);
        assert!(no_files(&fx.downloads));
    }

    #[tokio::test]
    async fn backup_failure_stops_before_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let work = tempfile::tempdir().unwrap();
        let install = work.path().join("StarMade");
        fs::create_dir_all(&install).unwrap();
        fs::write(install.join("StarMade.jar"), b"old").unwrap();
        let before = snapshot(&install);
        // A backup root inside the install tree is rejected.
        let coordinator = UpdateCoordinator::new(
            ManifestSource::with_base(server.uri()),
            BackupManager::new(install.join("backups")),
            work.path().join("downloads"),
        );
        let (listener, mut rx) = ChannelListener::channel();

        let outcome = coordinator
            .start(
                UpdateRequest {
                    install_dir: install.clone(),
                    entry: entry(),
                    scope: BackupScope::Everything,
                },
                listener,
            )
            .unwrap()
            .wait()
            .await;

        assert!(matches!(outcome, RunOutcome::Failed(UpdateError::Backup { .. })));
        assert_eq!(snapshot(&install), before);
        let events = drain(&mut rx);
        assert!(!events.contains(&UpdateEvent::State(RunState::Downloading)));
        assert_eq!(terminal_events(&events), 1);
    }

    #[tokio::test]
    async fn second_run_for_same_dir_is_rejected_and_cancel_cleans_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/build/b1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(zip_bytes(&[("StarMade.jar", b"jar")]))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;
        let fx = fixture(&server);
        let request = UpdateRequest {
            install_dir: fx.install.clone(),
            entry: entry(),
            scope: BackupScope::None,
        };

        let (first_listener, mut first_rx) = ChannelListener::channel();
        let first = fx.coordinator.start(request.clone(), first_listener).unwrap();
        assert!(fx.coordinator.is_active(&fx.install));

        let (second_listener, mut second_rx) = ChannelListener::channel();
        let rejected = fx.coordinator.start(request, second_listener);
        assert!(matches!(rejected, Err(UpdateError::AlreadyRunning { .. })));
        assert!(drain(&mut second_rx).is_empty());

        first.cancel();
        assert_eq!(first.wait().await, RunOutcome::Failed(UpdateError::Cancelled));
        assert!(!fx.coordinator.is_active(&fx.install));
        assert!(!fx.install.exists());
        assert!(no_files(&fx.downloads));
        assert_eq!(terminal_events(&drain(&mut first_rx)), 1);
    }

    #[test]
    fn download_names_are_filesystem_safe_and_per_run() {
        let entry = VersionEntry::new(Channel::Dev, "0.2", "a/b c", "./x");
        let name = download_name(&entry, 7);
        assert_eq!(name, format!("dev-a_b_c-{}-7.zip", std::process::id()));
        assert_ne!(download_name(&entry, 8), name);
    }

    #[tokio::test]
    async fn same_build_into_two_dirs_runs_concurrently() {
        let server = MockServer::start().await;
        let files: Vec<(String, Vec<u8>)> = (0..200)
            .map(|i| (format!("data/f{i}.txt"), vec![b'x'; 64]))
            .collect();
        let refs: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_slice()))
            .collect();
        Mock::given(method("GET"))
            .and(path("/build/b1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(zip_bytes(&refs))
                    .set_delay(Duration::from_millis(150)),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        serve_artifact(&server, &refs).await;
        let fx = fixture(&server);
        let other = fx.install.with_file_name("StarMade-server");
        let request = |install_dir: &Path| UpdateRequest {
            install_dir: install_dir.to_path_buf(),
            entry: entry(),
            scope: BackupScope::None,
        };

        let (slow_listener, _slow_rx) = ChannelListener::channel();
        let slow = fx
            .coordinator
            .start(request(&fx.install), slow_listener)
            .unwrap();
        let (fast_listener, _fast_rx) = ChannelListener::channel();
        let fast = fx.coordinator.start(request(&other), fast_listener).unwrap();

        assert_eq!(fast.wait().await, RunOutcome::Finished(entry()));
        assert_eq!(slow.wait().await, RunOutcome::Finished(entry()));
        for dir in [&fx.install, &other] {
            assert_eq!(snapshot(dir).len(), 201);
            let marker = storage::read_marker(dir).await.unwrap();
            assert!(entry().matches_marker(&marker));
        }
        assert!(no_files(&fx.downloads));
    }
}
