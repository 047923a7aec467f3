//! Stage descriptors: one unit of generative work with a quality policy.

use std::sync::Arc;

use cadence_types::{CadenceError, Result, QUALITY_SUFFIX};

use crate::scoring::{LengthScorer, Scorer};

pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.7;
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Immutable description of a stage.
///
/// Built once at configuration time and shared freely between runs; nothing
/// about an in-flight attempt is ever stored here.
#[derive(Clone)]
pub struct Stage {
    name: String,
    description: Option<String>,
    instruction: String,
    required_inputs: Vec<String>,
    output_key: String,
    tools: Vec<String>,
    quality_threshold: f64,
    max_retries: u32,
    scorer: Arc<dyn Scorer>,
}

impl Stage {
    /// A stage with the default threshold, retry budget and length scorer.
    pub fn new(name: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            instruction: String::new(),
            required_inputs: Vec::new(),
            output_key: output_key.into(),
            tools: Vec::new(),
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
            scorer: Arc::new(LengthScorer::default()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn requires<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_inputs.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_scorer(mut self, scorer: impl Scorer + 'static) -> Self {
        self.scorer = Arc::new(scorer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn required_inputs(&self) -> &[String] {
        &self.required_inputs
    }

    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    pub fn quality_threshold(&self) -> f64 {
        self.quality_threshold
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn scorer(&self) -> &dyn Scorer {
        self.scorer.as_ref()
    }

    /// Check the settings a stage can get wrong on its own.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CadenceError::InvalidConfiguration(msg));

        if self.name.trim().is_empty() {
            return invalid("stage name must not be empty".into());
        }
        if self.output_key.trim().is_empty() {
            return invalid(format!("stage '{}' has an empty output key", self.name));
        }
        if self.output_key.ends_with(QUALITY_SUFFIX) {
            return invalid(format!(
                "stage '{}' output key '{}' uses the reserved '{QUALITY_SUFFIX}' suffix",
                self.name, self.output_key
            ));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return invalid(format!(
                "stage '{}' quality threshold {} is outside [0, 1]",
                self.name, self.quality_threshold
            ));
        }
        if self.required_inputs.iter().any(|k| k == &self.output_key) {
            return invalid(format!(
                "stage '{}' requires its own output key '{}'",
                self.name, self.output_key
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("required_inputs", &self.required_inputs)
            .field("output_key", &self.output_key)
            .field("tools", &self.tools)
            .field("quality_threshold", &self.quality_threshold)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
