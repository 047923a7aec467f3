//! JSON pipeline definitions.
//!
//! ```json
//! {
//!   "name": "content",
//!   "seed_key": "topic",
//!   "phases": [
//!     {
//!       "name": "research",
//!       "stages": [
//!         { "name": "market_research", "instruction": "...",
//!           "required_inputs": ["topic"], "output_key": "research_report" }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use cadence_types::{CadenceError, QualityThresholds, Result};

use crate::engine::{Pipeline, PipelineBuilder, DEFAULT_SEED_KEY};
use crate::phase::Phase;
use crate::router::{ConditionalRouter, PredicateSpec};
use crate::stage::{Stage, DEFAULT_MAX_RETRIES, DEFAULT_QUALITY_THRESHOLD};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default = "default_seed_key")]
    pub seed_key: String,
    #[serde(default)]
    pub thresholds: QualityThresholds,
    /// Extra predicates available to phase guards, by name.
    #[serde(default)]
    pub predicates: BTreeMap<String, PredicateSpec>,
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub instruction: String,
    #[serde(default)]
    pub required_inputs: Vec<String>,
    pub output_key: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_seed_key() -> String {
    DEFAULT_SEED_KEY.to_string()
}

fn default_quality_threshold() -> f64 {
    DEFAULT_QUALITY_THRESHOLD
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl StageConfig {
    /// The stage described by this entry, scored by the default length scorer.
    pub fn to_stage(&self) -> Stage {
        let mut stage = Stage::new(&self.name, &self.output_key)
            .with_instruction(&self.instruction)
            .requires(self.required_inputs.iter().cloned())
            .with_tools(self.tools.iter().cloned())
            .with_threshold(self.quality_threshold)
            .with_max_retries(self.max_retries);
        if let Some(description) = &self.description {
            stage = stage.with_description(description);
        }
        stage
    }
}

impl PipelineConfig {
    pub fn from_json_str(source: &str) -> Result<Self> {
        serde_json::from_str(source)
            .map_err(|e| CadenceError::InvalidConfiguration(format!("pipeline config: {e}")))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        serde_json::from_str(&source).map_err(|e| {
            CadenceError::InvalidConfiguration(format!("{}: {e}", path.display()))
        })
    }

    /// Build and validate the described pipeline. Built-in predicates are
    /// always registered; `predicates` entries are added on top.
    pub fn into_pipeline(self) -> Result<Pipeline> {
        self.into_builder()?.build()
    }

    /// The builder for the described pipeline, before lint rules run.
    pub fn into_builder(self) -> Result<PipelineBuilder> {
        self.thresholds.validate()?;
        let mut router = ConditionalRouter::with_defaults(self.thresholds)?;
        for (name, spec) in &self.predicates {
            router.register_spec(name.clone(), spec)?;
        }

        let mut builder = Pipeline::builder(self.name)
            .seed_key(self.seed_key)
            .router(router);
        for phase_config in self.phases {
            let mut phase = Phase::new(phase_config.name, phase_config.description);
            for stage_config in &phase_config.stages {
                phase = phase.with_stage(stage_config.to_stage());
            }
            builder = match phase_config.guard {
                Some(guard) => builder.guarded_phase(phase, guard),
                None => builder.phase(phase),
            };
        }
        Ok(builder)
    }
}
