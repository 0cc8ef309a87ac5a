//! Lifecycle status of the supervised worker.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Where the runner is in its load cycle.
///
/// Advances `Launched -> LoadingModel -> Ready` within one load cycle. The
/// tracker does not enforce this; the load path is the only writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleStatus {
    /// Process is up, no model requested yet
    #[default]
    Launched,
    /// A commit is spawning the worker or waiting on its load
    LoadingModel,
    /// Worker accepted the model; completions may flow
    Ready,
}

/// Consistent (status, progress) pair read under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: LifecycleStatus,
    pub progress: f32,
}

/// Holds the current lifecycle status and load progress.
#[derive(Debug, Default)]
pub struct StatusTracker {
    inner: Mutex<StatusSnapshot>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: LifecycleStatus::Launched,
            progress: 0.0,
        }
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, status: LifecycleStatus, progress: f32) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = StatusSnapshot {
            status,
            progress: progress.clamp(0.0, 1.0),
        };
    }

    pub fn get(&self) -> StatusSnapshot {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
