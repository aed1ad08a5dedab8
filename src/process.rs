use crate::config::{Settings, SettingsStore};
use crate::discovery::discover;
use crate::error::{RouteError, SupervisorError};
use crate::launcher::INVOKE_COMMAND;
use crate::reconcile::{self, ProcessMatch};
use crate::routes::{LauncherSpec, RouteConfig, RouteTable};
use crate::status::StatusSnapshot;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Marker the dispatcher writes to its log once per request in verbose mode
const REQUEST_LOG_MARKER: &str = "incoming HTTP";

/// State of the dispatcher process
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatcherState {
    /// No dispatcher process
    Stopped,
    /// Routes are being generated or the dispatcher is inside its startup grace
    Starting,
    /// Dispatcher survived startup and is serving
    Running,
    /// Dispatcher is being terminated
    Stopping,
    /// Last start failed or the dispatcher died; behaves as stopped
    Failed,
}

impl DispatcherState {
    /// Whether a dispatcher is up or on its way up
    pub fn is_active(self) -> bool {
        matches!(self, DispatcherState::Starting | DispatcherState::Running)
    }
}

/// Timing and housekeeping knobs for the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// How long the dispatcher must survive before it counts as running
    pub startup_grace: Duration,
    /// How long a terminated dispatcher gets to exit on its own
    pub shutdown_grace: Duration,
    /// How long to wait after a forced kill before giving up on the process
    pub kill_wait: Duration,
    /// Sweep stray dispatcher and launcher processes before start and on shutdown
    pub reconcile: bool,
    /// Pause after a sweep that terminated something, so ports are released
    pub reconcile_settle: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
            kill_wait: Duration::from_secs(2),
            reconcile: true,
            reconcile_settle: Duration::from_secs(1),
        }
    }
}

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new dispatcher is running
    Started { pid: u32 },
    /// A dispatcher was already running or starting; nothing was done
    AlreadyRunning,
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The dispatcher was stopped. `graceful` is false when it had to be
    /// killed or could not be confirmed dead.
    Stopped { graceful: bool },
    /// No dispatcher was running
    AlreadyStopped,
}

/// A spawned dispatcher
struct DispatcherProcess {
    child: Child,
    pid: u32,
    started: Instant,
    started_at: DateTime<Utc>,
    log_path: PathBuf,
}

struct SupervisorState {
    state: DispatcherState,
    process: Option<DispatcherProcess>,
    endpoint_count: usize,
    request_count: u64,
    failure: Option<String>,
}

/// Owns the dispatcher process and its lifecycle.
///
/// Like the other long-lived managers this is used behind an `Arc`;
/// [`new`](Supervisor::new) returns one, and the `spawn_*` methods need it.
///
/// Transitions are serialized by an async lock held for the whole start or
/// stop. The state itself sits behind a short synchronous lock that is never
/// held across an await, so [`status`](Supervisor::status) never waits on a
/// transition in progress.
pub struct Supervisor {
    settings: Arc<SettingsStore>,
    launcher: LauncherSpec,
    options: SupervisorOptions,
    state: Mutex<SupervisorState>,
    transition: Arc<tokio::sync::Mutex<()>>,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl Supervisor {
    pub fn new(
        settings: Arc<SettingsStore>,
        launcher: LauncherSpec,
        options: SupervisorOptions,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(StatusSnapshot::stopped(settings.get().port()));
        Arc::new(Self {
            settings,
            launcher,
            options,
            state: Mutex::new(SupervisorState {
                state: DispatcherState::Stopped,
                process: None,
                endpoint_count: 0,
                request_count: 0,
                failure: None,
            }),
            transition: Arc::new(tokio::sync::Mutex::new(())),
            status_tx,
        })
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn state(&self) -> DispatcherState {
        self.state.lock().state
    }

    /// Receive a snapshot on every state transition
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    /// Discover endpoints and build the route table for the current settings
    /// without touching the hooks file
    pub fn route_table(&self) -> Result<RouteTable, RouteError> {
        let settings = self.settings.resolved();
        let files = discover(Path::new(&settings.endpoints_path));
        let config = RouteConfig::from_settings(&settings, &self.settings.base_dir(), self.launcher.clone());
        RouteTable::build(&files, &config)
    }

    /// Start the dispatcher.
    ///
    /// Returns [`StartOutcome::AlreadyRunning`] when a dispatcher is running
    /// or starting. Any failure leaves the supervisor in
    /// [`DispatcherState::Failed`] with the reason recorded.
    pub async fn start(&self) -> Result<StartOutcome, SupervisorError> {
        if self.state().is_active() {
            debug!("Dispatcher already running or starting");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let guard = Arc::clone(&self.transition).lock_owned().await;
        if self.state().is_active() {
            debug!("Dispatcher started while waiting for the transition lock");
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.begin_start();
        self.finish_start(guard).await
    }

    /// Start on a separate task. The `Starting` state is published before
    /// this returns unless another transition is in progress, in which case
    /// the start queues behind it.
    pub fn spawn_start(self: &Arc<Self>) -> JoinHandle<Result<StartOutcome, SupervisorError>> {
        let supervisor = Arc::clone(self);
        match Arc::clone(&self.transition).try_lock_owned() {
            Ok(guard) if !self.state().is_active() => {
                self.begin_start();
                tokio::spawn(async move { supervisor.finish_start(guard).await })
            }
            Ok(_) => tokio::spawn(async { Ok(StartOutcome::AlreadyRunning) }),
            Err(_) => tokio::spawn(async move { supervisor.start().await }),
        }
    }

    fn begin_start(&self) {
        let mut state = self.state.lock();
        state.state = DispatcherState::Starting;
        state.failure = None;
        self.publish(&state);
    }

    async fn finish_start(
        &self,
        _guard: OwnedMutexGuard<()>,
    ) -> Result<StartOutcome, SupervisorError> {
        match self.launch().await {
            Ok((process, endpoint_count)) => {
                let pid = process.pid;
                let mut state = self.state.lock();
                state.state = DispatcherState::Running;
                state.process = Some(process);
                state.endpoint_count = endpoint_count;
                state.request_count = 0;
                state.failure = None;
                self.publish(&state);
                info!(pid, endpoints = endpoint_count, "Dispatcher running");
                Ok(StartOutcome::Started { pid })
            }
            Err(e) => {
                error!(error = %e, "Failed to start dispatcher");
                let mut state = self.state.lock();
                state.state = DispatcherState::Failed;
                state.process = None;
                state.failure = Some(e.to_string());
                self.publish(&state);
                Err(e)
            }
        }
    }

    /// Generate routes, spawn the dispatcher and wait out the startup grace
    async fn launch(&self) -> Result<(DispatcherProcess, usize), SupervisorError> {
        let settings = self.settings.resolved();
        let base_dir = self.settings.base_dir();

        if self.options.reconcile {
            let swept = reconcile::sweep_async(self.stray_targets(&settings), Vec::new()).await;
            if swept > 0 {
                tokio::time::sleep(self.options.reconcile_settle).await;
            }
        }

        let endpoints_root = PathBuf::from(&settings.endpoints_path);
        tokio::fs::create_dir_all(&endpoints_root).await?;
        let files = tokio::task::spawn_blocking(move || discover(&endpoints_root))
            .await
            .map_err(std::io::Error::other)?;

        let config = RouteConfig::from_settings(&settings, &base_dir, self.launcher.clone());
        let table = RouteTable::build(&files, &config)?;
        let hooks_path = PathBuf::from(&settings.hooks_path);
        table.write_hooks_file(&hooks_path)?;

        let log_path = PathBuf::from(&settings.log_path);
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log = std::fs::File::create(&log_path)?;
        let log_err = log.try_clone()?;

        let command = dispatcher_command(&settings, &hooks_path);
        info!(command = %shell_words::join(&command), "Starting dispatcher");

        let mut child = Command::new(&command[0])
            .args(&command[1..])
            .current_dir(&base_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: settings.webhook_path.clone(),
                source,
            })?;
        let pid = child.id().unwrap_or(0);
        debug!(pid, grace_ms = self.options.startup_grace.as_millis() as u64, "Dispatcher spawned");

        tokio::time::sleep(self.options.startup_grace).await;
        if let Some(status) = child.try_wait()? {
            let output = read_log(&log_path);
            return Err(SupervisorError::StartupFailure {
                code: status.code(),
                output: output.trim().to_string(),
            });
        }

        Ok((
            DispatcherProcess {
                child,
                pid,
                started: Instant::now(),
                started_at: Utc::now(),
                log_path,
            },
            files.len(),
        ))
    }

    /// Stop the dispatcher. Always ends in [`DispatcherState::Stopped`] when
    /// a dispatcher was running, even if it could not be confirmed dead.
    pub async fn stop(&self) -> StopOutcome {
        if matches!(
            self.state(),
            DispatcherState::Stopped | DispatcherState::Failed | DispatcherState::Stopping
        ) {
            debug!("Dispatcher not running");
            return StopOutcome::AlreadyStopped;
        }

        let guard = Arc::clone(&self.transition).lock_owned().await;
        self.finish_stop(guard).await
    }

    /// Stop on a separate task; `Stopping` is published before this returns
    /// unless another transition is in progress.
    pub fn spawn_stop(self: &Arc<Self>) -> JoinHandle<StopOutcome> {
        let supervisor = Arc::clone(self);
        match Arc::clone(&self.transition).try_lock_owned() {
            Ok(guard) => {
                let process = self.begin_stop();
                tokio::spawn(async move { supervisor.terminate_and_settle(process, guard).await })
            }
            Err(_) => tokio::spawn(async move { supervisor.stop().await }),
        }
    }

    async fn finish_stop(&self, guard: OwnedMutexGuard<()>) -> StopOutcome {
        let process = self.begin_stop();
        self.terminate_and_settle(process, guard).await
    }

    /// Take the process out and mark `Stopping`, if there is one
    fn begin_stop(&self) -> Option<DispatcherProcess> {
        let mut state = self.state.lock();
        let process = state.process.take()?;
        state.state = DispatcherState::Stopping;
        self.publish(&state);
        Some(process)
    }

    async fn terminate_and_settle(
        &self,
        process: Option<DispatcherProcess>,
        _guard: OwnedMutexGuard<()>,
    ) -> StopOutcome {
        let Some(mut process) = process else {
            return StopOutcome::AlreadyStopped;
        };

        let graceful = self.terminate(&mut process.child, process.pid).await;

        let mut state = self.state.lock();
        state.state = DispatcherState::Stopped;
        state.failure = None;
        self.publish(&state);
        info!(pid = process.pid, graceful, "Dispatcher stopped");
        StopOutcome::Stopped { graceful }
    }

    /// Terminate, then kill after the grace period. Returns whether the
    /// dispatcher exited on its own.
    async fn terminate(&self, child: &mut Child, pid: u32) -> bool {
        if child.id().is_some() {
            info!(pid, "Sending SIGTERM to dispatcher");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(self.options.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid, ?status, "Dispatcher exited");
                return true;
            }
            Ok(Err(e)) => {
                warn!(pid, error = %e, "Error waiting for dispatcher to exit");
                return false;
            }
            Err(_) => {
                warn!(
                    pid,
                    grace_period_ms = self.options.shutdown_grace.as_millis() as u64,
                    "Dispatcher shutdown timed out, killing"
                );
            }
        }

        if let Err(e) = child.start_kill() {
            warn!(pid, error = %e, "Failed to kill dispatcher");
        }
        match tokio::time::timeout(self.options.kill_wait, child.wait()).await {
            Ok(_) => debug!(pid, "Dispatcher killed"),
            Err(_) => error!(pid, "Dispatcher did not exit after kill, abandoning it"),
        }
        false
    }

    /// Current status. Detects a dispatcher that died since the last check
    /// and refreshes the request counter from the dispatcher log.
    pub fn status(&self) -> StatusSnapshot {
        let counted = {
            let mut state = self.state.lock();
            if state.state != DispatcherState::Running {
                return self.snapshot(&state);
            }

            let exited = match state.process.as_mut() {
                Some(process) => match process.child.try_wait() {
                    Ok(Some(status)) => Some(format!("dispatcher exited unexpectedly ({})", status)),
                    Ok(None) => None,
                    Err(e) => Some(format!("dispatcher could not be checked: {}", e)),
                },
                None => Some("dispatcher handle lost".to_string()),
            };

            if let Some(reason) = exited {
                warn!(reason = %reason, "Dispatcher is no longer running");
                state.state = DispatcherState::Failed;
                state.process = None;
                state.failure = Some(reason);
                self.publish(&state);
                return self.snapshot(&state);
            }

            state.process.as_ref().map(|process| (process.pid, process.log_path.clone()))
        };

        // The log is read without holding the state lock
        let Some((pid, log_path)) = counted else {
            return self.snapshot(&self.state.lock());
        };
        let requests = count_requests(&log_path);

        let mut state = self.state.lock();
        let same_run = state.state == DispatcherState::Running
            && state.process.as_ref().map(|process| process.pid) == Some(pid);
        if same_run {
            state.request_count = requests;
        }
        self.snapshot(&state)
    }

    /// Stop the dispatcher and sweep any strays; used on exit
    pub async fn shutdown(&self) {
        self.stop().await;
        if self.options.reconcile {
            let settings = self.settings.resolved();
            let swept = reconcile::sweep_async(self.stray_targets(&settings), Vec::new()).await;
            if swept > 0 {
                info!(swept, "Terminated stray processes on shutdown");
            }
        }
    }

    /// Dispatcher processes plus launcher processes still running an endpoint
    fn stray_targets(&self, settings: &Settings) -> Vec<ProcessMatch> {
        vec![
            ProcessMatch::executable(&settings.webhook_path),
            ProcessMatch::executable(&self.launcher.program.to_string_lossy())
                .with_cmd_pattern(INVOKE_COMMAND),
        ]
    }

    fn snapshot(&self, state: &SupervisorState) -> StatusSnapshot {
        let running = state.state == DispatcherState::Running;
        let process = state.process.as_ref();
        StatusSnapshot {
            state: state.state,
            pid: process.map(|p| p.pid),
            port: self.settings.get().port(),
            started_at: process.map(|p| p.started_at),
            uptime: match process {
                Some(p) if running => p.started.elapsed(),
                _ => Duration::ZERO,
            },
            endpoint_count: state.endpoint_count,
            request_count: state.request_count,
            failure: state.failure.clone(),
        }
    }

    fn publish(&self, state: &SupervisorState) {
        self.status_tx.send_replace(self.snapshot(state));
    }
}

/// Dispatcher command line for resolved settings
pub fn dispatcher_command(settings: &Settings, hooks_path: &Path) -> Vec<String> {
    let mut command = vec![
        settings.webhook_path.clone(),
        "-hooks".to_string(),
        hooks_path.to_string_lossy().into_owned(),
        "-port".to_string(),
        settings.port().to_string(),
    ];
    if settings.verbose {
        command.push("-verbose".to_string());
    }
    // An empty prefix is passed through: the dispatcher then serves at root
    if let Some(prefix) = settings.url_prefix.as_deref() {
        command.push("-urlprefix".to_string());
        command.push(prefix.trim_matches('/').to_string());
    }
    command
}

/// Requests served so far according to a dispatcher log
pub fn count_requests(log_path: &Path) -> u64 {
    let Ok(file) = std::fs::File::open(log_path) else {
        return 0;
    };
    BufReader::new(file)
        .split(b'\n')
        .map_while(Result::ok)
        .filter(|line| String::from_utf8_lossy(line).contains(REQUEST_LOG_MARKER))
        .count() as u64
}

fn read_log(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("<log unavailable: {}>", e),
    }
}
