//! Quality-gated stage execution, conditional phase routing, and pipeline
//! orchestration.
//!
//! A [`Pipeline`] is an ordered list of [`Phase`]s, some guarded by named
//! predicates held in a [`ConditionalRouter`]. Each phase runs its [`Stage`]s
//! in order through a [`QualityGate`], which scores every attempt and retries
//! with feedback until the output passes or the retry budget is spent. The
//! [`PipelineOrchestrator`] drives a run from the initial input to the final
//! [`SharedState`](cadence_types::SharedState).

pub mod config;
pub mod engine;
pub mod events;
pub mod gate;
pub mod invoker;
pub mod invokers;
pub mod phase;
pub mod presets;
pub mod retry;
pub mod router;
pub mod scoring;
pub mod stage;
pub mod validation;

pub use config::{PhaseConfig, PipelineConfig, StageConfig};
pub use engine::{
    GuardedPhase, PhaseRecord, PhaseStatus, Pipeline, PipelineBuilder, PipelineOrchestrator,
    PipelineResult, RunFailure, RunState, DEFAULT_SEED_KEY,
};
pub use events::{EventEmitter, PipelineEvent};
pub use gate::{QualityGate, StageReport};
pub use invoker::{FnInvoker, StageInvoker, StageRequest};
pub use invokers::{EchoInvoker, ModelInvoker, ModelInvokerConfig};
pub use phase::{Phase, PhaseFailure};
pub use retry::{effective_instruction, BackoffPolicy, RetryContext};
pub use router::{ConditionalRouter, Predicate, PredicateSpec};
pub use scoring::{FnScorer, LengthScorer, Scorer};
pub use stage::Stage;
pub use validation::{validate, validate_or_raise, validate_tools, Diagnostic, LintRule, Severity};

pub use tokio_util::sync::CancellationToken;
