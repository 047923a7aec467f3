//! Pipeline event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers can follow a run without coupling to the orchestrator.

use serde::{Deserialize, Serialize};

/// Events emitted during a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        pipeline: String,
        phase_count: usize,
    },
    PhaseStarted {
        phase: String,
        index: usize,
    },
    PhaseSkipped {
        phase: String,
        guard: String,
    },
    PhaseCompleted {
        phase: String,
        stage_count: usize,
    },
    StageAttemptStarted {
        stage: String,
        attempt: u32,
    },
    StageInvocationFailed {
        stage: String,
        attempt: u32,
        error: String,
    },
    StageRetrying {
        stage: String,
        attempt: u32,
        score: f64,
    },
    StageAccepted {
        stage: String,
        attempts: u32,
        score: f64,
        passed: bool,
    },
    RunCompleted {
        run_id: String,
        duration_ms: u64,
    },
    RunFailed {
        run_id: String,
        error: String,
    },
    RunCancelled {
        run_id: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers; dropped when there are none.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
