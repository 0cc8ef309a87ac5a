//! airllm-runner: supervisor and protocol bridge for an AirLLM inference worker.

mod gate;
mod status;
mod supervisor;

pub mod bridge;
pub mod service;
pub mod transport;

pub use gate::ReadinessGate;
pub use service::{BridgeError, RunnerConfig, RunnerService};
pub use status::{LifecycleStatus, StatusSnapshot, StatusTracker};
pub use supervisor::{
    COMPRESSION_ENV, PythonSpawner, SpawnError, SupervisorConfig, SupervisorError, WORKER_PYTHONPATH,
    WORKER_SCRIPT, WorkerLaunch, WorkerSpawner, WorkerSupervisor, allocate_worker_port,
    default_worker_candidates, resolve_worker_script, worker_base_url,
};
pub use transport::{ServerConfig, serve};
