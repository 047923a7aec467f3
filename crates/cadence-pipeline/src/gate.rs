//! The quality gate: invoke a stage, score it, and retry with feedback until
//! the output passes or the retry budget runs out.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use cadence_types::{CadenceError, QualityScore, Result, SharedState};

use crate::events::{EventEmitter, PipelineEvent};
use crate::invoker::{StageInvoker, StageRequest};
use crate::retry::{effective_instruction, BackoffPolicy, RetryContext};
use crate::stage::Stage;

/// Summary of how one stage finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub output_key: String,
    pub attempts: u32,
    pub score: f64,
    pub passed: bool,
}

/// Retry controller wrapping each stage execution.
#[derive(Clone, Default)]
pub struct QualityGate {
    backoff: BackoffPolicy,
    events: EventEmitter,
}

impl QualityGate {
    pub fn new(backoff: BackoffPolicy, events: EventEmitter) -> Self {
        Self { backoff, events }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Run `stage` against `state` until an attempt is accepted.
    ///
    /// An attempt is accepted when its score meets the stage threshold or it
    /// is the last one allowed. The accepted score is written under
    /// `<output_key>_quality`. Missing inputs, scorer failures, terminal
    /// invoker errors and an invocation failure on the final attempt are
    /// returned as errors.
    pub async fn execute(
        &self,
        stage: &Stage,
        invoker: &dyn StageInvoker,
        state: &mut SharedState,
        cancel: &CancellationToken,
    ) -> Result<StageReport> {
        if let Some(key) = stage
            .required_inputs()
            .iter()
            .find(|k| !state.contains_key(k))
        {
            return Err(CadenceError::MissingRequiredInput {
                stage: stage.name().to_string(),
                key: key.clone(),
            });
        }

        let inputs = state.project(stage.required_inputs());
        let max_retries = stage.max_retries();
        let mut feedback: Vec<RetryContext> = Vec::new();

        for attempt in 0..=max_retries {
            if cancel.is_cancelled() {
                return Err(CadenceError::Cancelled);
            }

            let is_last = attempt == max_retries;
            let request = StageRequest {
                stage: stage.name().to_string(),
                instruction: effective_instruction(stage.instruction(), &feedback),
                inputs: inputs.clone(),
                tools: stage.tools().to_vec(),
                attempt,
            };

            tracing::debug!(stage = %stage.name(), attempt, "Invoking stage");
            self.events.emit(PipelineEvent::StageAttemptStarted {
                stage: stage.name().to_string(),
                attempt,
            });

            let (score, invoked) = match invoker.invoke(&request).await {
                Ok(value) => {
                    state.insert(stage.output_key(), value);
                    let score = stage
                        .scorer()
                        .score(state, stage.output_key())
                        .map_err(|e| scoring_failure(stage, e))?
                        .normalized();
                    (score, true)
                }
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    tracing::warn!(stage = %stage.name(), attempt, error = %e, "Stage invocation failed");
                    self.events.emit(PipelineEvent::StageInvocationFailed {
                        stage: stage.name().to_string(),
                        attempt,
                        error: e.to_string(),
                    });
                    if is_last {
                        return Err(invocation_failure(stage, e));
                    }
                    (QualityScore::invocation_failed(&e), false)
                }
            };

            // A failed invocation never passes, even against a zero threshold.
            let passed = invoked && score.meets(stage.quality_threshold());
            if passed || is_last {
                state.set_quality(stage.output_key(), &score);
                tracing::info!(
                    stage = %stage.name(),
                    attempts = attempt + 1,
                    score = score.score,
                    passed,
                    "Stage accepted"
                );
                self.events.emit(PipelineEvent::StageAccepted {
                    stage: stage.name().to_string(),
                    attempts: attempt + 1,
                    score: score.score,
                    passed,
                });
                return Ok(StageReport {
                    stage: stage.name().to_string(),
                    output_key: stage.output_key().to_string(),
                    attempts: attempt + 1,
                    score: score.score,
                    passed,
                });
            }

            tracing::info!(
                stage = %stage.name(),
                attempt,
                score = score.score,
                threshold = stage.quality_threshold(),
                "Below threshold, retrying"
            );
            self.events.emit(PipelineEvent::StageRetrying {
                stage: stage.name().to_string(),
                attempt,
                score: score.score,
            });
            feedback.push(RetryContext { attempt, score });

            let delay = self.backoff.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(CadenceError::Cancelled),
                }
            }
        }

        // The final iteration always returns.
        Err(CadenceError::Other(format!(
            "stage '{}' exhausted its attempts without a result",
            stage.name()
        )))
    }
}

fn scoring_failure(stage: &Stage, err: CadenceError) -> CadenceError {
    match err {
        CadenceError::ScoringFailure { .. } => err,
        other => CadenceError::ScoringFailure {
            stage: stage.name().to_string(),
            message: other.to_string(),
        },
    }
}

fn invocation_failure(stage: &Stage, err: CadenceError) -> CadenceError {
    match err {
        CadenceError::StageInvocation { .. } => err,
        other => CadenceError::StageInvocation {
            stage: stage.name().to_string(),
            message: other.to_string(),
        },
    }
}
