//! Worker supervisor - owns the AirLLM worker subprocess.
//!
//! Flow:
//! 1. Resolve the worker script from an ordered candidate list
//! 2. Spawn it through a [`WorkerSpawner`], output routed to our stderr
//! 3. Hand the child to a reaper task that logs its exit
//! 4. Poll the worker's `/health` until it accepts connections
//!
//! There is exactly one worker slot. The worker is never restarted
//! automatically; a new "commit" is the only way to get a fresh one.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

/// File name of the Python worker entry point.
pub const WORKER_SCRIPT: &str = "airllm_runner.py";

/// Module search path handed to the worker.
pub const WORKER_PYTHONPATH: &str = "/usr/share/ollama/airllm:/usr/share/ollama/airllm/air_llm";

/// Compression mode forwarded from our environment when set.
pub const COMPRESSION_ENV: &str = "AIRLLM_COMPRESSION";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_HEALTH_ATTEMPTS: u32 = 60;
/// Floor for a single health request; an attempt never waits less.
const MIN_HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("airllm_runner.py not found")]
    WorkerNotFound,
    #[error("failed to start worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker already running (pid {pid:?})")]
    AlreadyRunning { pid: Option<u32> },
    #[error("timeout waiting for worker to start after {attempts} attempts")]
    StartupTimeout { attempts: u32 },
    #[error("worker exited before becoming healthy")]
    WorkerExited,
    #[error("failed to allocate worker port: {0}")]
    PortAllocation(std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Io(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Everything a spawner needs to start one worker.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub script: PathBuf,
    pub model_path: String,
    pub port: u16,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Child, SpawnError>;
}

/// Runs the worker script under a Python interpreter.
#[derive(Debug, Clone)]
pub struct PythonSpawner {
    interpreter: String,
}

impl Default for PythonSpawner {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
        }
    }
}

impl WorkerSpawner for PythonSpawner {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(&launch.script)
            .arg("--model")
            .arg(&launch.model_path)
            .arg("--port")
            .arg(launch.port.to_string())
            .env("PYTHONPATH", WORKER_PYTHONPATH)
            .stdin(Stdio::null())
            .stdout(std::io::stderr())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Ok(compression) = std::env::var(COMPRESSION_ENV)
            && !compression.is_empty()
        {
            cmd.env(COMPRESSION_ENV, compression);
        }

        Ok(cmd.spawn()?)
    }
}

/// Default worker script locations, in lookup order.
pub fn default_worker_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![
        PathBuf::from("/usr/share/ollama").join(WORKER_SCRIPT),
        PathBuf::from("/usr/lib/ollama").join(WORKER_SCRIPT),
    ];
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        candidates.push(dir.join(WORKER_SCRIPT));
    }
    candidates
}

/// First candidate that exists on disk.
pub fn resolve_worker_script(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.exists()).cloned()
}

/// Reserve a free loopback port for the worker.
pub fn allocate_worker_port() -> Result<u16, SupervisorError> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(SupervisorError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(SupervisorError::PortAllocation)?
        .port();
    Ok(port)
}

#[derive(Clone)]
pub struct SupervisorConfig {
    pub candidates: Vec<PathBuf>,
    pub poll_interval: Duration,
    pub max_health_attempts: u32,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl std::fmt::Debug for SupervisorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorConfig")
            .field("candidates", &self.candidates)
            .field("poll_interval", &self.poll_interval)
            .field("max_health_attempts", &self.max_health_attempts)
            .finish_non_exhaustive()
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self {
            candidates: default_worker_candidates(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_health_attempts: DEFAULT_HEALTH_ATTEMPTS,
            spawner: Arc::new(PythonSpawner::default()),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<PathBuf>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_health_attempts(mut self, attempts: u32) -> Self {
        self.max_health_attempts = attempts;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

struct WorkerHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited_rx: watch::Receiver<bool>,
}

impl WorkerHandle {
    fn has_exited(&self) -> bool {
        *self.exited_rx.borrow()
    }
}

/// Owns the single worker process slot.
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    client: reqwest::Client,
    worker: Mutex<Option<WorkerHandle>>,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start the worker for `model_path`, listening on `port`.
    ///
    /// Must be called from within a tokio runtime: the reaper is a tokio task.
    pub fn spawn(&self, model_path: &str, port: u16) -> Result<Option<u32>, SupervisorError> {
        let script = resolve_worker_script(&self.config.candidates)
            .ok_or(SupervisorError::WorkerNotFound)?;

        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref()
            && !existing.has_exited()
        {
            return Err(SupervisorError::AlreadyRunning { pid: existing.pid });
        }

        let launch = WorkerLaunch {
            script,
            model_path: model_path.to_string(),
            port,
        };
        tracing::info!(script = %launch.script.display(), model = %launch.model_path, port, "Spawning worker subprocess");
        let child = self.config.spawner.spawn(&launch)?;
        let pid = child.id();

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        tokio::spawn(reap_worker(child, pid, kill_rx, exited_tx));

        *slot = Some(WorkerHandle {
            pid,
            kill_tx: Some(kill_tx),
            exited_rx,
        });
        Ok(pid)
    }

    /// Poll `<base_url>/health` until it answers 200.
    ///
    /// Attempts start one poll interval apart and each request is cut off
    /// after that interval (at least 250 ms), so a worker that accepts the
    /// connection but never answers still fails after roughly
    /// `attempts × interval`. If a worker was spawned and has since exited
    /// or been terminated, polling stops early.
    pub async fn wait_for_health(&self, base_url: &str) -> Result<(), SupervisorError> {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        let attempts = self.config.max_health_attempts;
        let interval = self.config.poll_interval;
        let request_timeout = interval.max(MIN_HEALTH_REQUEST_TIMEOUT);
        let supervised = self.has_worker();

        for attempt in 1..=attempts {
            if supervised && !self.is_running() {
                return Err(SupervisorError::WorkerExited);
            }

            let started = Instant::now();
            match self.client.get(&url).timeout(request_timeout).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    tracing::info!(attempt, "Worker is ready");
                    return Ok(());
                }
                Ok(resp) => {
                    tracing::debug!(attempt, status = %resp.status(), "Worker not healthy yet");
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Worker not reachable yet");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(interval.saturating_sub(started.elapsed())).await;
            }
        }

        Err(SupervisorError::StartupTimeout { attempts })
    }

    /// Kill the worker if one is running. Returns whether a kill was issued.
    pub fn terminate(&self) -> bool {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(mut handle) = handle else {
            return false;
        };
        if handle.has_exited() {
            return false;
        }

        tracing::info!(pid = ?handle.pid, "Killing worker");
        match handle.kill_tx.take() {
            Some(kill_tx) => kill_tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|h| !h.has_exited())
            .and_then(|h| h.pid)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.has_exited())
    }

    /// Resolves once the current worker (if any) has exited.
    pub async fn wait_for_exit(&self) {
        let exited_rx = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|h| h.exited_rx.clone());
        if let Some(mut exited_rx) = exited_rx {
            let _ = exited_rx.wait_for(|exited| *exited).await;
        }
    }

    fn has_worker(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Waits for the worker to exit, or kills it on request.
///
/// A dropped kill sender counts as a kill request, so the worker never
/// outlives its supervisor.
async fn reap_worker(
    mut child: Child,
    pid: Option<u32>,
    kill_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(?pid, error = %e, "Failed to kill worker");
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => tracing::info!(?pid, %status, "Worker exited"),
        Err(e) => tracing::warn!(?pid, error = %e, "Failed to wait for worker"),
    }
    exited_tx.send_replace(true);
}

/// Base URL for a worker listening on `host:port`.
pub fn worker_base_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}")
}
