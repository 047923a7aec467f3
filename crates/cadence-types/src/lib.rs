//! Shared types, errors, state, and quality scores for the Cadence pipeline engine.
//!
//! This crate provides the foundational types used across all other Cadence crates:
//! - `CadenceError`: unified error taxonomy
//! - `SharedState`: ordered key-value store threaded through a pipeline run
//! - `QualityScore`: score, issues, and suggestions for one stage attempt
//! - `QualityThresholds`: the named low/medium/high threshold table

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unified error type for all Cadence subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    // === LLM Provider Errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthError { provider: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    RequestTimeout { provider: String, timeout_ms: u64 },

    // === Stage Errors ===
    #[error("Stage '{stage}' invocation failed: {message}")]
    StageInvocation { stage: String, message: String },

    #[error("Scoring function failed for stage '{stage}': {message}")]
    ScoringFailure { stage: String, message: String },

    #[error("Stage '{stage}' is missing required input '{key}'")]
    MissingRequiredInput { stage: String, key: String },

    // === Configuration Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No predicate registered under '{name}'")]
    UnknownPredicate { name: String },

    // === Tool Errors ===
    #[error("Tool '{tool}' error: {message}")]
    ToolError { tool: String, message: String },

    // === Run Control ===
    #[error("Pipeline run was cancelled")]
    Cancelled,

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of a [`CadenceError`], reported alongside the
/// offending identifier when a run fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Provider,
    RateLimited,
    Auth,
    Timeout,
    StageInvocation,
    ScoringFailure,
    MissingRequiredInput,
    InvalidConfiguration,
    UnknownPredicate,
    Tool,
    Cancelled,
    Io,
    Json,
    Other,
}

impl CadenceError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CadenceError::RateLimited { .. }
                | CadenceError::RequestTimeout { .. }
                | CadenceError::ProviderError {
                    retryable: true,
                    ..
                }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CadenceError::AuthError { .. }
                | CadenceError::InvalidConfiguration(_)
                | CadenceError::UnknownPredicate { .. }
                | CadenceError::Cancelled
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CadenceError::ProviderError { .. } => ErrorKind::Provider,
            CadenceError::RateLimited { .. } => ErrorKind::RateLimited,
            CadenceError::AuthError { .. } => ErrorKind::Auth,
            CadenceError::RequestTimeout { .. } => ErrorKind::Timeout,
            CadenceError::StageInvocation { .. } => ErrorKind::StageInvocation,
            CadenceError::ScoringFailure { .. } => ErrorKind::ScoringFailure,
            CadenceError::MissingRequiredInput { .. } => ErrorKind::MissingRequiredInput,
            CadenceError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            CadenceError::UnknownPredicate { .. } => ErrorKind::UnknownPredicate,
            CadenceError::ToolError { .. } => ErrorKind::Tool,
            CadenceError::Cancelled => ErrorKind::Cancelled,
            CadenceError::Io(_) => ErrorKind::Io,
            CadenceError::Json(_) => ErrorKind::Json,
            CadenceError::Other(_) => ErrorKind::Other,
        }
    }

    /// The identifier the error is about (stage, key, provider, tool or
    /// predicate name), if there is one.
    pub fn subject(&self) -> Option<&str> {
        match self {
            CadenceError::ProviderError { provider, .. }
            | CadenceError::RateLimited { provider, .. }
            | CadenceError::AuthError { provider }
            | CadenceError::RequestTimeout { provider, .. } => Some(provider.as_str()),
            CadenceError::StageInvocation { stage, .. }
            | CadenceError::ScoringFailure { stage, .. } => Some(stage.as_str()),
            CadenceError::MissingRequiredInput { key, .. } => Some(key.as_str()),
            CadenceError::UnknownPredicate { name } => Some(name.as_str()),
            CadenceError::ToolError { tool, .. } => Some(tool.as_str()),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, CadenceError>`.
pub type Result<T> = std::result::Result<T, CadenceError>;

// ---------------------------------------------------------------------------
// QualityScore
// ---------------------------------------------------------------------------

/// Suffix appended to a stage's output key to store its quality metadata.
pub const QUALITY_SUFFIX: &str = "_quality";

/// The state key holding the quality metadata for `output_key`.
pub fn quality_key(output_key: &str) -> String {
    format!("{output_key}{QUALITY_SUFFIX}")
}

/// Score, issues, and suggestions describing one stage attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl QualityScore {
    /// Create a score with no issues. Values outside `[0, 1]` are clamped.
    pub fn new(score: f64) -> Self {
        Self {
            score,
            issues: Vec::new(),
            suggestions: Vec::new(),
        }
        .normalized()
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// The zero score recorded for an attempt whose invocation failed.
    pub fn invocation_failed(detail: impl std::fmt::Display) -> Self {
        Self::new(0.0)
            .with_issue("invocation failed")
            .with_suggestion(format!("Produce a complete response; the previous call failed with: {detail}"))
    }

    /// Clamp the score into `[0, 1]`; NaN becomes `0.0`.
    pub fn normalized(mut self) -> Self {
        self.score = if self.score.is_nan() {
            0.0
        } else {
            self.score.clamp(0.0, 1.0)
        };
        self
    }

    pub fn meets(&self, threshold: f64) -> bool {
        self.score >= threshold
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "score": self.score,
            "issues": self.issues,
            "suggestions": self.suggestions,
        })
    }

    /// Read a score back out of state. A bare number is accepted as a score
    /// with no issues.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(Self::new),
            Value::Object(_) => serde_json::from_value::<Self>(value.clone())
                .ok()
                .map(Self::normalized),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// QualityThresholds
// ---------------------------------------------------------------------------

/// Named threshold table passed explicitly to components that gate on quality.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualityThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            low: 0.4,
            medium: 0.7,
            high: 0.9,
        }
    }
}

impl QualityThresholds {
    /// Every threshold must lie in `[0, 1]` and `low <= medium <= high`.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("low", self.low), ("medium", self.medium), ("high", self.high)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CadenceError::InvalidConfiguration(format!(
                    "threshold '{name}' = {value} is outside [0, 1]"
                )));
            }
        }
        if self.low > self.medium || self.medium > self.high {
            return Err(CadenceError::InvalidConfiguration(format!(
                "thresholds must be ordered low <= medium <= high (got {}, {}, {})",
                self.low, self.medium, self.high
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SharedState: ordered key-value store threaded through a run
// ---------------------------------------------------------------------------

/// Ordered key-value store owned by a single pipeline run.
///
/// Keys keep their first insertion position, so iterating a finished run's
/// state shows outputs in the order stages produced them. Replacing a value
/// does not move its key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedState {
    values: Map<String, Value>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A state holding a single seed value.
    pub fn seeded(key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut state = Self::new();
        state.insert(key, value.into());
        state
    }

    /// Insert or replace a key, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// The value at `key` when it is a JSON string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The quality metadata recorded for `output_key`, if any.
    pub fn quality(&self, output_key: &str) -> Option<QualityScore> {
        self.values
            .get(&quality_key(output_key))
            .and_then(QualityScore::from_value)
    }

    pub fn set_quality(&mut self, output_key: &str, score: &QualityScore) {
        self.values.insert(quality_key(output_key), score.to_value());
    }

    /// A copy restricted to `keys`, in the order given. Absent keys are skipped.
    pub fn project<S: AsRef<str>>(&self, keys: &[S]) -> SharedState {
        let mut view = SharedState::new();
        for key in keys {
            if let Some(value) = self.values.get(key.as_ref()) {
                view.insert(key.as_ref(), value.clone());
            }
        }
        view
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }
}

impl From<Map<String, Value>> for SharedState {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}
