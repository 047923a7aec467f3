//! Phases: ordered groups of quality-gated stages.

use tokio_util::sync::CancellationToken;

use cadence_types::{quality_key, CadenceError, SharedState};

use crate::gate::{QualityGate, StageReport};
use crate::invoker::StageInvoker;
use crate::stage::Stage;

#[derive(Debug, Clone)]
pub struct Phase {
    name: String,
    description: String,
    stages: Vec<Stage>,
}

/// A phase stopped at `stage` with `error`; `completed` holds the stages that
/// finished before it.
#[derive(Debug)]
pub struct PhaseFailure {
    pub error: CadenceError,
    pub stage: String,
    pub completed: Vec<StageReport>,
}

impl Phase {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            stages: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Every key a full run of this phase writes: each output key followed by
    /// its quality key.
    pub fn written_keys(&self) -> Vec<String> {
        self.stages
            .iter()
            .flat_map(|s| [s.output_key().to_string(), quality_key(s.output_key())])
            .collect()
    }

    /// Execute every stage through `gate`, strictly in order.
    pub async fn execute(
        &self,
        gate: &QualityGate,
        invoker: &dyn StageInvoker,
        state: &mut SharedState,
        cancel: &CancellationToken,
    ) -> Result<Vec<StageReport>, PhaseFailure> {
        let mut completed = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            match gate.execute(stage, invoker, state, cancel).await {
                Ok(report) => completed.push(report),
                Err(error) => {
                    return Err(PhaseFailure {
                        error,
                        stage: stage.name().to_string(),
                        completed,
                    })
                }
            }
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::{FnInvoker, StageRequest};
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn written_keys_pair_outputs_with_quality() {
        let phase = Phase::new("messaging", "Positioning")
            .with_stage(Stage::new("messaging", "messaging"))
            .with_stage(Stage::new("tagline", "tagline"));
        assert_eq!(
            phase.written_keys(),
            vec!["messaging", "messaging_quality", "tagline", "tagline_quality"]
        );
    }

    #[tokio::test]
    async fn stages_run_in_declared_order() {
        let order = Mutex::new(Vec::new());
        let invoker = FnInvoker::new(|req: &StageRequest| {
            order.lock().unwrap().push(req.stage.clone());
            Ok(json!("x".repeat(500)))
        });
        let phase = Phase::new("p", "")
            .with_stage(Stage::new("first", "a"))
            .with_stage(Stage::new("second", "b").requires(["a"]));
        let mut state = SharedState::new();

        let reports = phase
            .execute(&QualityGate::default(), &invoker, &mut state, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        let keys: Vec<&str> = state.keys().collect();
        assert_eq!(keys, vec!["a", "a_quality", "b", "b_quality"]);
    }

    #[tokio::test]
    async fn failure_reports_stage_and_completed_work() {
        let invoker = FnInvoker::new(|_req: &StageRequest| Ok(json!("x".repeat(500))));
        let phase = Phase::new("p", "")
            .with_stage(Stage::new("first", "a"))
            .with_stage(Stage::new("second", "b").requires(["missing"]));
        let mut state = SharedState::new();

        let failure = phase
            .execute(&QualityGate::default(), &invoker, &mut state, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.stage, "second");
        assert_eq!(failure.completed.len(), 1);
        assert!(matches!(failure.error, CadenceError::MissingRequiredInput { .. }));
        assert!(state.contains_key("a"));
    }
}
