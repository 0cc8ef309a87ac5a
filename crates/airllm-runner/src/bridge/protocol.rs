//! Wire types for both JSON dialects.
//!
//! Two contracts:
//! - **Public**: what the front-end sends to this runner (`LoadRequest`,
//!   `CompletionRequest`, ...). Stable.
//! - **Worker**: what the Python worker speaks (`Worker*` types). Raw string
//!   done-reasons, integer nanosecond durations, strict field sets.
//!
//! The two sides only meet through the `From` impls at the bottom, so either
//! can change without leaking into the other. Leaf payloads that are
//! byte-for-byte identical in both (`ImageData`, `Logprob`) are shared.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::status::{LifecycleStatus, StatusSnapshot};

/// Accept `null` where a collection or enum is expected.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `Duration` as an integer nanosecond count.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

// ---------------------------------------------------------------------------
// Public contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadOperation {
    /// Spawn the worker and load the model
    Commit,
    /// Kill the worker
    Close,
    /// Anything else, including empty. Accepted as a no-op.
    #[default]
    #[serde(other)]
    Other,
}

impl LoadOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Close => "close",
            Self::Other => "",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadRequest {
    #[serde(deserialize_with = "null_as_default")]
    pub operation: LoadOperation,
    pub model_path: String,
    #[serde(deserialize_with = "null_as_default")]
    pub lora_path: Vec<String>,
    pub projector_path: String,
    pub parallel: u32,
    pub batch_size: u32,
    pub kv_size: u32,
    pub kv_cache_type: String,
    pub flash_attention: String,
    pub num_threads: u32,
    pub multi_user_cache: bool,
    /// Per-device layer placement, passed through untouched.
    #[serde(deserialize_with = "null_as_default")]
    pub gpu_layers: Vec<serde_json::Value>,
    pub main_gpu: i32,
    pub use_mmap: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoadResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Image attachment; `data` is base64 as sent by the front-end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageData {
    pub data: String,
    pub id: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenLogprob {
    pub token: String,
    pub logprob: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Logprob {
    #[serde(flatten)]
    pub token: TokenLogprob,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub top_logprobs: Vec<TokenLogprob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(deserialize_with = "null_as_default")]
    pub images: Vec<ImageData>,
    pub grammar: String,
    pub options: Option<serde_json::Map<String, serde_json::Value>>,
    pub logprobs: bool,
    pub top_logprobs: u32,
    pub shift: bool,
    pub truncate: bool,
}

/// Why a generation stream ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneReason {
    #[default]
    Stop,
    Length,
}

impl DoneReason {
    /// Map the worker's raw reason. Unknown values mean Stop.
    pub fn from_worker(reason: &str) -> Self {
        match reason {
            "length" => Self::Length,
            _ => Self::Stop,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logprobs: Vec<Logprob>,
    pub done: bool,
    pub done_reason: DoneReason,
    pub prompt_eval_count: u32,
    #[serde(with = "duration_nanos")]
    pub prompt_eval_duration: Duration,
    pub eval_count: u32,
    #[serde(with = "duration_nanos")]
    pub eval_duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingRequest {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
    pub prompt_eval_count: u32,
}

/// Public `/health` document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: LifecycleStatus,
    pub progress: f32,
}

// ---------------------------------------------------------------------------
// Worker contract
// ---------------------------------------------------------------------------

/// The worker rejects unknown keys, so this is exactly its field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLoadRequest {
    pub operation: String,
    pub model_path: String,
    pub lora_path: Vec<String>,
    pub projector_path: String,
    pub parallel: u32,
    pub batch_size: u32,
    pub kv_size: u32,
    pub kv_cache_type: String,
    pub flash_attention: String,
    pub num_threads: u32,
    pub multi_user_cache: bool,
    pub gpu_layers: Vec<serde_json::Value>,
    pub main_gpu: i32,
    pub use_mmap: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerLoadResponse {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCompletionRequest {
    pub prompt: String,
    pub images: Vec<ImageData>,
    pub grammar: String,
    pub options: serde_json::Map<String, serde_json::Value>,
    pub logprobs: bool,
    pub top_logprobs: u32,
    pub shift: bool,
    pub truncate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCompletionResponse {
    pub content: String,
    #[serde(deserialize_with = "null_as_default")]
    pub logprobs: Vec<Logprob>,
    pub done: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub done_reason: String,
    pub prompt_eval_count: u32,
    /// Nanoseconds
    pub prompt_eval_duration: i64,
    pub eval_count: u32,
    /// Nanoseconds
    pub eval_duration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEmbeddingRequest {
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerEmbeddingResponse {
    pub embedding: Vec<f32>,
    pub prompt_eval_count: u32,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

fn worker_nanos(nanos: i64) -> Duration {
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(0))
}

impl From<&LoadRequest> for WorkerLoadRequest {
    fn from(req: &LoadRequest) -> Self {
        Self {
            operation: req.operation.as_str().to_string(),
            model_path: req.model_path.clone(),
            lora_path: req.lora_path.clone(),
            projector_path: req.projector_path.clone(),
            parallel: req.parallel,
            batch_size: req.batch_size,
            kv_size: req.kv_size,
            kv_cache_type: req.kv_cache_type.clone(),
            flash_attention: req.flash_attention.clone(),
            num_threads: req.num_threads,
            multi_user_cache: req.multi_user_cache,
            gpu_layers: req.gpu_layers.clone(),
            main_gpu: req.main_gpu,
            use_mmap: req.use_mmap,
        }
    }
}

impl From<WorkerLoadResponse> for LoadResponse {
    fn from(resp: WorkerLoadResponse) -> Self {
        Self {
            success: resp.success,
            error: resp.error.filter(|e| !e.is_empty()),
        }
    }
}

impl From<CompletionRequest> for WorkerCompletionRequest {
    fn from(req: CompletionRequest) -> Self {
        Self {
            prompt: req.prompt,
            images: req.images,
            grammar: req.grammar,
            options: req.options.unwrap_or_default(),
            logprobs: req.logprobs,
            top_logprobs: req.top_logprobs,
            shift: req.shift,
            truncate: req.truncate,
        }
    }
}

impl From<WorkerCompletionResponse> for CompletionResponse {
    fn from(resp: WorkerCompletionResponse) -> Self {
        Self {
            content: resp.content,
            logprobs: resp.logprobs,
            done: resp.done,
            done_reason: DoneReason::from_worker(&resp.done_reason),
            prompt_eval_count: resp.prompt_eval_count,
            prompt_eval_duration: worker_nanos(resp.prompt_eval_duration),
            eval_count: resp.eval_count,
            eval_duration: worker_nanos(resp.eval_duration),
        }
    }
}

impl From<EmbeddingRequest> for WorkerEmbeddingRequest {
    fn from(req: EmbeddingRequest) -> Self {
        Self {
            content: req.content,
        }
    }
}

impl From<WorkerEmbeddingResponse> for EmbeddingResponse {
    fn from(resp: WorkerEmbeddingResponse) -> Self {
        Self {
            embedding: resp.embedding,
            prompt_eval_count: resp.prompt_eval_count,
        }
    }
}

impl From<StatusSnapshot> for StatusResponse {
    fn from(snapshot: StatusSnapshot) -> Self {
        Self {
            status: snapshot.status,
            progress: snapshot.progress,
        }
    }
}
