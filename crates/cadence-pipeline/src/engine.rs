//! Pipeline composition and the orchestrator that drives a run.
//!
//! A run seeds [`SharedState`] from the initial input, walks the phases in
//! order (consulting the router for guarded ones) and returns the accumulated
//! state together with a per-phase report.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cadence_types::{CadenceError, ErrorKind, QualityThresholds, Result, SharedState};

use crate::events::{EventEmitter, PipelineEvent};
use crate::gate::{QualityGate, StageReport};
use crate::invoker::StageInvoker;
use crate::phase::Phase;
use crate::retry::BackoffPolicy;
use crate::router::{ConditionalRouter, Predicate};
use crate::validation::validate_or_raise;

pub const DEFAULT_SEED_KEY: &str = "topic";

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A phase and the optional predicate that must hold for it to run.
#[derive(Debug, Clone)]
pub struct GuardedPhase {
    pub phase: Phase,
    pub guard: Option<String>,
}

/// Ordered phases plus the router that evaluates their guards.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    seed_key: String,
    phases: Vec<GuardedPhase>,
    router: ConditionalRouter,
}

impl Pipeline {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seed_key(&self) -> &str {
        &self.seed_key
    }

    pub fn phases(&self) -> &[GuardedPhase] {
        &self.phases
    }

    pub fn router(&self) -> &ConditionalRouter {
        &self.router
    }

    pub fn stage_count(&self) -> usize {
        self.phases.iter().map(|p| p.phase.stages().len()).sum()
    }
}

pub struct PipelineBuilder {
    name: String,
    seed_key: String,
    thresholds: QualityThresholds,
    phases: Vec<GuardedPhase>,
    router: Option<ConditionalRouter>,
    predicates: Vec<(String, Predicate)>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seed_key: DEFAULT_SEED_KEY.to_string(),
            thresholds: QualityThresholds::default(),
            phases: Vec::new(),
            router: None,
            predicates: Vec::new(),
        }
    }

    pub fn seed_key(mut self, key: impl Into<String>) -> Self {
        self.seed_key = key.into();
        self
    }

    /// Threshold table for the default router. Ignored when an explicit
    /// router is supplied.
    pub fn thresholds(mut self, thresholds: QualityThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(GuardedPhase { phase, guard: None });
        self
    }

    pub fn guarded_phase(mut self, phase: Phase, guard: impl Into<String>) -> Self {
        self.phases.push(GuardedPhase {
            phase,
            guard: Some(guard.into()),
        });
        self
    }

    /// Replace the default router (built-in predicates over `thresholds`).
    pub fn router(mut self, router: ConditionalRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn predicate(mut self, name: impl Into<String>, predicate: Predicate) -> Self {
        self.predicates.push((name.into(), predicate));
        self
    }

    /// Assemble the pipeline and reject it if any lint rule reports an error.
    pub fn build(self) -> Result<Pipeline> {
        let pipeline = self.build_unchecked()?;
        validate_or_raise(&pipeline)?;
        Ok(pipeline)
    }

    /// Assemble the pipeline without running lint rules.
    pub fn build_unchecked(self) -> Result<Pipeline> {
        if self.seed_key.trim().is_empty() {
            return Err(CadenceError::InvalidConfiguration(
                "seed key must not be empty".into(),
            ));
        }
        let mut router = match self.router {
            Some(router) => router,
            None => {
                self.thresholds.validate()?;
                ConditionalRouter::with_defaults(self.thresholds)?
            }
        };
        for (name, predicate) in self.predicates {
            router.register(name, predicate);
        }
        Ok(Pipeline {
            name: self.name,
            seed_key: self.seed_key,
            phases: self.phases,
            router,
        })
    }
}

// ---------------------------------------------------------------------------
// Run state and results
// ---------------------------------------------------------------------------

/// Progress of one run. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    RunningPhase(usize),
    Skipping(usize),
    Completed,
    Failed,
}

impl RunState {
    fn rank(self) -> (usize, usize) {
        match self {
            RunState::NotStarted => (0, 0),
            RunState::RunningPhase(i) | RunState::Skipping(i) => (1, i),
            RunState::Completed | RunState::Failed => (2, 0),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    /// Whether moving from `self` to `next` keeps the run moving forward.
    pub fn can_transition_to(self, next: RunState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    pub stages: Vec<StageReport>,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub state: SharedState,
    pub phases: Vec<PhaseRecord>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// A run that stopped early: the error, where it happened, and the partial
/// state accumulated up to that point.
#[derive(Debug, thiserror::Error)]
#[error("pipeline run {run_id} failed: {error}")]
pub struct RunFailure {
    pub run_id: Uuid,
    #[source]
    pub error: CadenceError,
    pub state: SharedState,
    pub phases: Vec<PhaseRecord>,
    pub phase: Option<String>,
    pub stage: Option<String>,
}

impl RunFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// The offending identifier: the error's own subject, or else the stage
    /// or phase it happened in.
    pub fn subject(&self) -> Option<&str> {
        self.error
            .subject()
            .or(self.stage.as_deref())
            .or(self.phase.as_deref())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, CadenceError::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// PipelineOrchestrator
// ---------------------------------------------------------------------------

/// Drives runs of one pipeline through one invoker.
///
/// Holds no per-run data, so a single orchestrator can serve concurrent runs.
pub struct PipelineOrchestrator {
    pipeline: Pipeline,
    invoker: Arc<dyn StageInvoker>,
    gate: QualityGate,
    events: EventEmitter,
}

struct RunTracker {
    run_id: Uuid,
    state: RunState,
    shared: SharedState,
    records: Vec<PhaseRecord>,
}

impl RunTracker {
    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid run transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(from = ?self.state, to = ?next, "Run state transition");
        self.state = next;
    }

    fn fail(
        mut self,
        error: CadenceError,
        phase: Option<String>,
        stage: Option<String>,
    ) -> RunFailure {
        self.advance(RunState::Failed);
        RunFailure {
            run_id: self.run_id,
            error,
            state: self.shared,
            phases: self.records,
            phase,
            stage,
        }
    }
}

impl PipelineOrchestrator {
    pub fn new(pipeline: Pipeline, invoker: impl StageInvoker + 'static) -> Self {
        Self::with_shared_invoker(pipeline, Arc::new(invoker))
    }

    pub fn with_shared_invoker(pipeline: Pipeline, invoker: Arc<dyn StageInvoker>) -> Self {
        let events = EventEmitter::default();
        Self {
            pipeline,
            invoker,
            gate: QualityGate::new(BackoffPolicy::None, events.clone()),
            events,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.gate = QualityGate::new(backoff, self.events.clone());
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.gate = QualityGate::new(self.gate.backoff().clone(), events.clone());
        self.events = events;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub async fn run(&self, input: impl Into<String>) -> std::result::Result<PipelineResult, RunFailure> {
        self.run_with_cancellation(input, CancellationToken::new())
            .await
    }

    /// Run the pipeline, stopping at the next stage attempt or phase boundary
    /// once `cancel` fires. An invocation already in flight is awaited.
    pub async fn run_with_cancellation(
        &self,
        input: impl Into<String>,
        cancel: CancellationToken,
    ) -> std::result::Result<PipelineResult, RunFailure> {
        let input: String = input.into();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut run = RunTracker {
            run_id,
            state: RunState::NotStarted,
            shared: SharedState::seeded(self.pipeline.seed_key(), input),
            records: Vec::new(),
        };

        tracing::info!(
            run_id = %run_id,
            pipeline = %self.pipeline.name(),
            phases = self.pipeline.phases().len(),
            "Pipeline run started"
        );
        self.events.emit(PipelineEvent::RunStarted {
            run_id: run_id.to_string(),
            pipeline: self.pipeline.name().to_string(),
            phase_count: self.pipeline.phases().len(),
        });

        for (index, guarded) in self.pipeline.phases().iter().enumerate() {
            let phase = &guarded.phase;

            if cancel.is_cancelled() {
                return Err(self.cancelled(run, Some(phase.name().to_string()), None));
            }

            if let Some(guard) = &guarded.guard {
                let should_run = match self.pipeline.router().evaluate(guard, &run.shared) {
                    Ok(b) => b,
                    Err(e) => return Err(self.failed(run, e, Some(phase.name().to_string()), None)),
                };
                if !should_run {
                    run.advance(RunState::Skipping(index));
                    tracing::info!(phase = %phase.name(), guard = %guard, "Guard false, skipping phase");
                    self.events.emit(PipelineEvent::PhaseSkipped {
                        phase: phase.name().to_string(),
                        guard: guard.clone(),
                    });
                    run.records.push(PhaseRecord {
                        name: phase.name().to_string(),
                        status: PhaseStatus::Skipped,
                        guard: Some(guard.clone()),
                        stages: Vec::new(),
                    });
                    continue;
                }
            }

            run.advance(RunState::RunningPhase(index));
            tracing::info!(phase = %phase.name(), stages = phase.stages().len(), "Running phase");
            self.events.emit(PipelineEvent::PhaseStarted {
                phase: phase.name().to_string(),
                index,
            });

            match phase
                .execute(&self.gate, self.invoker.as_ref(), &mut run.shared, &cancel)
                .await
            {
                Ok(stages) => {
                    self.events.emit(PipelineEvent::PhaseCompleted {
                        phase: phase.name().to_string(),
                        stage_count: stages.len(),
                    });
                    run.records.push(PhaseRecord {
                        name: phase.name().to_string(),
                        status: PhaseStatus::Completed,
                        guard: guarded.guard.clone(),
                        stages,
                    });
                }
                Err(failure) => {
                    run.records.push(PhaseRecord {
                        name: phase.name().to_string(),
                        status: PhaseStatus::Failed,
                        guard: guarded.guard.clone(),
                        stages: failure.completed,
                    });
                    let phase_name = Some(phase.name().to_string());
                    let stage_name = Some(failure.stage);
                    return Err(match failure.error {
                        CadenceError::Cancelled => self.cancelled(run, phase_name, stage_name),
                        error => self.failed(run, error, phase_name, stage_name),
                    });
                }
            }
        }

        run.advance(RunState::Completed);
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(run_id = %run_id, duration_ms, keys = run.shared.len(), "Pipeline run completed");
        self.events.emit(PipelineEvent::RunCompleted {
            run_id: run_id.to_string(),
            duration_ms,
        });

        Ok(PipelineResult {
            run_id,
            state: run.shared,
            phases: run.records,
            started_at,
            duration_ms,
        })
    }

    fn failed(
        &self,
        run: RunTracker,
        error: CadenceError,
        phase: Option<String>,
        stage: Option<String>,
    ) -> RunFailure {
        tracing::error!(
            run_id = %run.run_id,
            kind = ?error.kind(),
            subject = error.subject().unwrap_or_default(),
            error = %error,
            "Pipeline run failed"
        );
        self.events.emit(PipelineEvent::RunFailed {
            run_id: run.run_id.to_string(),
            error: error.to_string(),
        });
        run.fail(error, phase, stage)
    }

    fn cancelled(&self, run: RunTracker, phase: Option<String>, stage: Option<String>) -> RunFailure {
        tracing::warn!(run_id = %run.run_id, "Pipeline run cancelled");
        self.events.emit(PipelineEvent::RunCancelled {
            run_id: run.run_id.to_string(),
        });
        run.fail(CadenceError::Cancelled, phase, stage)
    }
}
