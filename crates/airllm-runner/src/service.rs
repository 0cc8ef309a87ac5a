//! RunnerService: transport-agnostic load/completion lifecycle.
//!
//! This service owns:
//! - The worker supervisor (spawn, health wait, kill)
//! - Status tracking (status, progress)
//! - The readiness gate that holds completion traffic until a model is loaded
//! - Shutdown coordination
//!
//! Transports (HTTP) decode requests and delegate here.

use std::io;
use std::sync::{Mutex, PoisonError};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::bridge::codec::ConcatJsonCodec;
use crate::bridge::protocol::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, LoadOperation,
    LoadRequest, LoadResponse, StatusResponse, WorkerCompletionRequest, WorkerCompletionResponse,
    WorkerEmbeddingRequest, WorkerEmbeddingResponse, WorkerLoadRequest, WorkerLoadResponse,
};
use crate::gate::ReadinessGate;
use crate::status::{LifecycleStatus, StatusTracker};
use crate::supervisor::{
    SupervisorConfig, SupervisorError, WorkerSupervisor, allocate_worker_port, worker_base_url,
};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("worker request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("worker returned {status}: {body}")]
    WorkerStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("no worker loaded")]
    NotLoaded,
}

/// How the service reaches its worker.
#[derive(Debug)]
pub struct RunnerConfig {
    /// Model handed to the worker on its command line. Empty means use the
    /// `model_path` of the commit request.
    pub model_path: String,
    pub worker_host: String,
    /// Fixed worker port. `None` allocates a free loopback port per commit.
    pub worker_port: Option<u16>,
    pub supervisor: SupervisorConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            worker_host: "127.0.0.1".to_string(),
            worker_port: None,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_path(mut self, model_path: impl Into<String>) -> Self {
        self.model_path = model_path.into();
        self
    }

    pub fn with_worker_host(mut self, host: impl Into<String>) -> Self {
        self.worker_host = host.into();
        self
    }

    pub fn with_worker_port(mut self, port: Option<u16>) -> Self {
        self.worker_port = port;
        self
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }
}

/// Transport-agnostic runner service.
pub struct RunnerService {
    model_path: String,
    worker_host: String,
    worker_port: Option<u16>,

    status: StatusTracker,
    gate: ReadinessGate,
    supervisor: WorkerSupervisor,
    client: reqwest::Client,

    /// Base URL of the live worker, set once it passed its health check.
    worker_url: Mutex<Option<String>>,
    /// Load operations run one at a time.
    load_lock: tokio::sync::Mutex<()>,

    shutdown_tx: watch::Sender<bool>,
}

impl RunnerService {
    pub fn new(config: RunnerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            model_path: config.model_path,
            worker_host: config.worker_host,
            worker_port: config.worker_port,
            status: StatusTracker::new(),
            gate: ReadinessGate::new(),
            supervisor: WorkerSupervisor::new(config.supervisor),
            client: reqwest::Client::new(),
            worker_url: Mutex::new(None),
            load_lock: tokio::sync::Mutex::new(()),
            shutdown_tx,
        }
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    pub fn gate(&self) -> &ReadinessGate {
        &self.gate
    }

    pub fn health(&self) -> StatusResponse {
        self.status.get().into()
    }

    /// Run a load operation. Failures are reported in the response body.
    ///
    /// Commits run one at a time. Close does not wait for an in-flight
    /// commit: it kills that commit's worker, which makes the commit fail.
    pub async fn load(&self, req: LoadRequest) -> LoadResponse {
        match req.operation {
            LoadOperation::Commit => {
                let _guard = self.load_lock.lock().await;
                match self.commit(&req).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        tracing::error!(error = %e, "Model load failed");
                        LoadResponse::failed(e.to_string())
                    }
                }
            }
            LoadOperation::Close => {
                self.close();
                LoadResponse::ok()
            }
            LoadOperation::Other => {
                tracing::debug!("Ignoring load request without a known operation");
                LoadResponse::ok()
            }
        }
    }

    async fn commit(&self, req: &LoadRequest) -> Result<LoadResponse, BridgeError> {
        // A live worker keeps serving; leave its status alone.
        if self.supervisor.is_running() {
            return Err(SupervisorError::AlreadyRunning {
                pid: self.supervisor.pid(),
            }
            .into());
        }

        self.status.set(LifecycleStatus::LoadingModel, 0.0);

        let model_path = if self.model_path.is_empty() {
            req.model_path.as_str()
        } else {
            self.model_path.as_str()
        };
        let port = match self.worker_port {
            Some(port) => port,
            None => allocate_worker_port()?,
        };
        let base_url = worker_base_url(&self.worker_host, port);

        let pid = self.supervisor.spawn(model_path, port)?;
        tracing::info!(?pid, %base_url, "Waiting for worker to become healthy");

        // From here on any failure leaves no worker behind, so the next
        // commit can spawn again.
        let resp = match self.start_worker(&base_url, req, model_path).await {
            Ok(resp) if resp.success => resp,
            Ok(resp) => {
                tracing::warn!(error = ?resp.error, "Worker rejected load");
                self.close();
                return Ok(resp);
            }
            Err(e) => {
                self.close();
                return Err(e);
            }
        };

        // A close that raced the load has already taken the worker.
        if !self.supervisor.is_running() {
            self.close();
            return Err(SupervisorError::WorkerExited.into());
        }

        self.set_worker_url(Some(base_url));
        self.status.set(LifecycleStatus::Ready, 1.0);
        if !self.gate.is_open() {
            self.gate.open();
        }
        tracing::info!(model = %model_path, "Model loaded");
        Ok(resp)
    }

    /// Wait for the spawned worker to answer, then forward the load to it.
    async fn start_worker(
        &self,
        base_url: &str,
        req: &LoadRequest,
        model_path: &str,
    ) -> Result<LoadResponse, BridgeError> {
        self.supervisor.wait_for_health(base_url).await?;

        let mut worker_req = WorkerLoadRequest::from(req);
        if worker_req.model_path.is_empty() {
            worker_req.model_path = model_path.to_string();
        }

        let resp = self
            .client
            .post(format!("{base_url}/load"))
            .json(&worker_req)
            .send()
            .await?;
        let worker_resp: WorkerLoadResponse = check_status(resp).await?.json().await?;
        Ok(worker_resp.into())
    }

    fn close(&self) {
        self.set_worker_url(None);
        if self.supervisor.terminate() {
            tracing::info!("Worker closed");
        }
    }

    /// Stream a completion from the worker.
    ///
    /// Blocks until a model has been loaded. Errors returned here happen
    /// before any chunk; once streaming, a decode or transport failure just
    /// ends the stream.
    pub async fn completion(
        &self,
        req: CompletionRequest,
    ) -> Result<BoxStream<'static, CompletionResponse>, BridgeError> {
        self.gate.wait().await;
        let base_url = self.worker_url().ok_or(BridgeError::NotLoaded)?;

        let resp = self
            .client
            .post(format!("{base_url}/completion"))
            .json(&WorkerCompletionRequest::from(req))
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let body = resp.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
        let frames = FramedRead::new(
            StreamReader::new(body),
            ConcatJsonCodec::<WorkerCompletionResponse>::new(),
        );

        let relay = futures::stream::unfold(Some(Box::pin(frames)), |frames| async move {
            let mut frames = frames?;
            match frames.next().await {
                Some(Ok(chunk)) => {
                    let done = chunk.done;
                    let next = if done { None } else { Some(frames) };
                    Some((CompletionResponse::from(chunk), next))
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Worker stream ended early");
                    None
                }
                None => None,
            }
        });
        Ok(relay.boxed())
    }

    /// Compute an embedding. Blocks until a model has been loaded.
    pub async fn embedding(&self, req: EmbeddingRequest) -> Result<EmbeddingResponse, BridgeError> {
        self.gate.wait().await;
        let base_url = self.worker_url().ok_or(BridgeError::NotLoaded)?;

        let resp = self
            .client
            .post(format!("{base_url}/embedding"))
            .json(&WorkerEmbeddingRequest::from(req))
            .send()
            .await?;
        let worker: WorkerEmbeddingResponse = check_status(resp).await?.json().await?;
        Ok(worker.into())
    }

    /// Kill the worker and signal transports to stop.
    pub fn shutdown(&self) {
        self.close();
        self.trigger_shutdown();
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn worker_url(&self) -> Option<String> {
        self.worker_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_worker_url(&self, url: Option<String>) {
        *self.worker_url.lock().unwrap_or_else(PoisonError::into_inner) = url;
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BridgeError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BridgeError::WorkerStatus { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::DoneReason;
    use crate::supervisor::tests::test_config;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn commit(model_path: &str) -> LoadRequest {
        LoadRequest {
            operation: LoadOperation::Commit,
            model_path: model_path.to_string(),
            ..Default::default()
        }
    }

    fn close() -> LoadRequest {
        LoadRequest {
            operation: LoadOperation::Close,
            ..Default::default()
        }
    }

    fn service_for(worker: &MockServer, supervisor: SupervisorConfig) -> RunnerService {
        RunnerService::new(
            RunnerConfig::new()
                .with_worker_port(Some(worker.address().port()))
                .with_supervisor(supervisor),
        )
    }

    async fn healthy_worker() -> MockServer {
        let worker = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "launched", "progress": 0.0})),
            )
            .mount(&worker)
            .await;
        worker
    }

    async fn accepting_load(worker: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/load"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(worker)
            .await;
    }

    async fn streaming(worker: &MockServer, body: &str) {
        Mock::given(method("POST"))
            .and(path("/completion"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
            .mount(worker)
            .await;
    }

    #[tokio::test]
    async fn starts_launched_with_gate_closed() {
        let service = RunnerService::new(RunnerConfig::new());
        assert_eq!(service.health().status, LifecycleStatus::Launched);
        assert_eq!(service.health().progress, 0.0);
        assert!(!service.gate().is_open());
    }

    #[tokio::test]
    async fn commit_without_worker_script_fails_and_stays_loading() {
        let service = RunnerService::new(
            RunnerConfig::new().with_supervisor(SupervisorConfig::new().with_candidates(vec![])),
        );

        let resp = service.load(commit("/models/llama")).await;
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("airllm_runner.py not found"));
        assert_eq!(service.health().status, LifecycleStatus::LoadingModel);
        assert!(!service.gate().is_open());
    }

    #[tokio::test]
    async fn unknown_operation_is_a_no_op() {
        let service = RunnerService::new(RunnerConfig::new());
        let resp = service.load(LoadRequest::default()).await;
        assert_eq!(resp, LoadResponse::ok());
        assert_eq!(service.health().status, LifecycleStatus::Launched);
        assert!(!service.supervisor().is_running());
    }

    #[tokio::test]
    async fn close_without_worker_succeeds() {
        let service = RunnerService::new(RunnerConfig::new());
        assert_eq!(service.load(close()).await, LoadResponse::ok());
        assert_eq!(service.load(close()).await, LoadResponse::ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn commit_reaches_ready_and_opens_gate() {
        let worker = healthy_worker().await;
        Mock::given(method("POST"))
            .and(path("/load"))
            .and(body_partial_json(
                json!({"operation": "commit", "model_path": "/models/llama"}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&worker)
            .await;

        let (_dir, config) = test_config(30);
        let service = service_for(&worker, config);

        let resp = service.load(commit("/models/llama")).await;
        assert_eq!(resp, LoadResponse::ok());
        assert_eq!(service.health().status, LifecycleStatus::Ready);
        assert_eq!(service.health().progress, 1.0);
        assert!(service.gate().is_open());
        assert!(service.supervisor().is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn commit_fills_model_path_from_config() {
        let worker = healthy_worker().await;
        Mock::given(method("POST"))
            .and(path("/load"))
            .and(body_partial_json(json!({"model_path": "/models/configured"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&worker)
            .await;

        let (_dir, config) = test_config(30);
        let service = RunnerService::new(
            RunnerConfig::new()
                .with_model_path("/models/configured")
                .with_worker_port(Some(worker.address().port()))
                .with_supervisor(config),
        );

        assert!(service.load(commit("")).await.success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_rejection_is_returned_and_gate_stays_closed() {
        let worker = healthy_worker().await;
        Mock::given(method("POST"))
            .and(path("/load"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": false, "error": "No model path"})),
            )
            .mount(&worker)
            .await;

        let (_dir, config) = test_config(30);
        let service = service_for(&worker, config);

        let resp = service.load(commit("/models/llama")).await;
        assert_eq!(resp, LoadResponse::failed("No model path"));
        assert_eq!(service.health().status, LifecycleStatus::LoadingModel);
        assert!(!service.gate().is_open());
        assert!(!service.supervisor().is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn commit_can_be_retried_after_rejection() {
        let worker = healthy_worker().await;
        Mock::given(method("POST"))
            .and(path("/load"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": false, "error": "out of memory"})),
            )
            .up_to_n_times(1)
            .mount(&worker)
            .await;
        accepting_load(&worker).await;

        let (_dir, config) = test_config(30);
        let service = service_for(&worker, config);

        assert_eq!(
            service.load(commit("/models/llama")).await,
            LoadResponse::failed("out of memory")
        );
        assert_eq!(service.load(commit("/models/llama")).await, LoadResponse::ok());
        assert_eq!(service.health().status, LifecycleStatus::Ready);
        assert!(service.gate().is_open());
        assert!(service.supervisor().is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_load_reply_kills_worker() {
        let worker = healthy_worker().await;
        Mock::given(method("POST"))
            .and(path("/load"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("loading...", "text/plain"))
            .up_to_n_times(1)
            .mount(&worker)
            .await;
        accepting_load(&worker).await;

        let (_dir, config) = test_config(30);
        let service = service_for(&worker, config);

        let resp = service.load(commit("/models/llama")).await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().starts_with("worker request failed"));
        assert!(!service.supervisor().is_running());
        assert!(!service.gate().is_open());

        assert!(service.load(commit("/models/llama")).await.success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn recommit_while_ready_keeps_status_and_worker() {
        let worker = healthy_worker().await;
        accepting_load(&worker).await;
        let (_dir, config) = test_config(30);
        let service = service_for(&worker, config);

        assert!(service.load(commit("/models/llama")).await.success);
        let pid = service.supervisor().pid();

        let resp = service.load(commit("/models/other")).await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("already running"));

        assert_eq!(service.health().status, LifecycleStatus::Ready);
        assert_eq!(service.health().progress, 1.0);
        assert!(service.gate().is_open());
        assert_eq!(service.supervisor().pid(), pid);
        let loads = worker
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.url.path() == "/load")
            .count();
        assert_eq!(loads, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn health_timeout_fails_commit_and_kills_worker() {
        // No /health mock: every poll gets a 404.
        let worker = MockServer::start().await;
        let (_dir, config) = test_config(30);
        let service = service_for(&worker, config.with_max_health_attempts(3));

        let resp = service.load(commit("/models/llama")).await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("after 3 attempts"));
        assert_eq!(service.health().status, LifecycleStatus::LoadingModel);

        tokio::time::timeout(Duration::from_secs(5), service.supervisor().wait_for_exit())
            .await
            .expect("worker killed");
        assert!(!service.supervisor().is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn commit_can_be_retried_after_timeout() {
        let worker = MockServer::start().await;
        let (_dir, config) = test_config(30);
        let service = service_for(&worker, config.with_max_health_attempts(2));

        assert!(!service.load(commit("/models/llama")).await.success);
        service.supervisor().wait_for_exit().await;

        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&worker)
            .await;
        accepting_load(&worker).await;

        assert!(service.load(commit("/models/llama")).await.success);
        assert_eq!(service.health().status, LifecycleStatus::Ready);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_kills_running_worker() {
        let worker = healthy_worker().await;
        accepting_load(&worker).await;
        let (_dir, config) = test_config(30);
        let service = service_for(&worker, config);

        assert!(service.load(commit("/models/llama")).await.success);
        assert!(service.supervisor().is_running());

        assert_eq!(service.load(close()).await, LoadResponse::ok());
        tokio::time::timeout(Duration::from_secs(5), service.supervisor().wait_for_exit())
            .await
            .expect("worker killed");
        assert_eq!(service.load(close()).await, LoadResponse::ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_does_not_wait_for_hung_commit() {
        let worker = healthy_worker().await;
        Mock::given(method("POST"))
            .and(path("/load"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": true}))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&worker)
            .await;

        let (_dir, config) = test_config(30);
        let service = Arc::new(service_for(&worker, config));

        let committing = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.load(commit("/models/llama")).await })
        };

        // Wait until the commit is parked on the worker's /load.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let requests = worker.received_requests().await.unwrap();
                if requests.iter().any(|r| r.url.path() == "/load") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("commit reached /load");
        assert!(service.supervisor().is_running());

        let resp = tokio::time::timeout(Duration::from_secs(2), service.load(close()))
            .await
            .expect("close not blocked by commit");
        assert_eq!(resp, LoadResponse::ok());
        assert!(!service.supervisor().is_running());
        assert!(!service.gate().is_open());

        committing.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_during_health_wait_fails_commit() {
        // No /health mock: the commit keeps polling until closed.
        let worker = MockServer::start().await;
        let (_dir, config) = test_config(30);
        let service = Arc::new(service_for(&worker, config.with_max_health_attempts(1000)));

        let committing = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.load(commit("/models/llama")).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(service.supervisor().is_running());
        assert_eq!(service.load(close()).await, LoadResponse::ok());

        let resp = tokio::time::timeout(Duration::from_secs(2), committing)
            .await
            .expect("commit stopped")
            .unwrap();
        assert_eq!(
            resp,
            LoadResponse::failed("worker exited before becoming healthy")
        );
        assert!(!service.gate().is_open());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn completion_waits_for_commit() {
        let worker = healthy_worker().await;
        accepting_load(&worker).await;
        streaming(&worker, r#"{"content":"hi","done":true,"done_reason":"stop"}"#).await;

        let (_dir, config) = test_config(30);
        let service = Arc::new(service_for(&worker, config));

        let pending = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let stream = service
                    .completion(CompletionRequest {
                        prompt: "hello".to_string(),
                        ..Default::default()
                    })
                    .await
                    .unwrap();
                stream.collect::<Vec<_>>().await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pending.is_finished());
        let requests = worker.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| r.url.path() != "/completion"));

        assert!(service.load(commit("/models/llama")).await.success);

        let chunks = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("completion released")
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn relay_preserves_order_and_stops_after_done() {
        let worker = healthy_worker().await;
        accepting_load(&worker).await;
        streaming(
            &worker,
            concat!(
                r#"{"content":"The"}"#,
                r#"{"content":" sky","logprobs":null}"#,
                "\n",
                r#"{"content":" is","done":false}"#,
                r#"{"content":"","done":true,"done_reason":"length","eval_count":3,"eval_duration":1500}"#,
                r#"{"content":"after done"}"#,
            ),
        )
        .await;

        let (_dir, config) = test_config(30);
        let service = service_for(&worker, config);
        assert!(service.load(commit("/models/llama")).await.success);

        let chunks: Vec<_> = service
            .completion(CompletionRequest::default())
            .await
            .unwrap()
            .collect()
            .await;

        let contents: Vec<_> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, ["The", " sky", " is", ""]);
        let last = chunks.last().unwrap();
        assert!(last.done);
        assert_eq!(last.done_reason, DoneReason::Length);
        assert_eq!(last.eval_count, 3);
        assert_eq!(last.eval_duration, Duration::from_nanos(1500));
        assert!(chunks[..3].iter().all(|c| !c.done));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn relay_ends_silently_on_malformed_chunk() {
        let worker = healthy_worker().await;
        accepting_load(&worker).await;
        streaming(&worker, r#"{"content":"ok"}{"content":oops}"#).await;

        let (_dir, config) = test_config(30);
        let service = service_for(&worker, config);
        assert!(service.load(commit("/models/llama")).await.success);

        let chunks: Vec<_> = service
            .completion(CompletionRequest::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "ok");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_error_status_fails_before_streaming() {
        let worker = healthy_worker().await;
        accepting_load(&worker).await;
        Mock::given(method("POST"))
            .and(path("/completion"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(json!({"error": "Model not ready"})),
            )
            .mount(&worker)
            .await;

        let (_dir, config) = test_config(30);
        let service = service_for(&worker, config);
        assert!(service.load(commit("/models/llama")).await.success);

        match service.completion(CompletionRequest::default()).await {
            Err(BridgeError::WorkerStatus { status, body }) => {
                assert_eq!(status, reqwest::StatusCode::SERVICE_UNAVAILABLE);
                assert!(body.contains("Model not ready"));
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn completion_after_close_reports_not_loaded() {
        let worker = healthy_worker().await;
        accepting_load(&worker).await;
        let (_dir, config) = test_config(30);
        let service = service_for(&worker, config);
        assert!(service.load(commit("/models/llama")).await.success);

        service.load(close()).await;

        assert!(matches!(
            service.completion(CompletionRequest::default()).await,
            Err(BridgeError::NotLoaded)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn embedding_relays_after_load() {
        let worker = healthy_worker().await;
        accepting_load(&worker).await;
        Mock::given(method("POST"))
            .and(path("/embedding"))
            .and(body_partial_json(json!({"content": "hello world"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"embedding": [0.5, -0.25], "prompt_eval_count": 2})),
            )
            .mount(&worker)
            .await;

        let (_dir, config) = test_config(30);
        let service = service_for(&worker, config);
        assert!(service.load(commit("/models/llama")).await.success);

        let resp = service
            .embedding(EmbeddingRequest {
                content: "hello world".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(resp.embedding, vec![0.5, -0.25]);
        assert_eq!(resp.prompt_eval_count, 2);
    }

    #[tokio::test]
    async fn shutdown_signals_subscribers() {
        let service = RunnerService::new(RunnerConfig::new());
        let mut rx = service.shutdown_rx();
        assert!(!*rx.borrow());
        service.shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
