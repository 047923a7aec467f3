//! Named boolean predicates over shared state that decide whether a guarded
//! phase runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use cadence_types::{CadenceError, QualityScore, QualityThresholds, Result, SharedState};

pub const NEEDS_COMPETITIVE_ANALYSIS: &str = "needs_competitive_analysis";
pub const NEEDS_MESSAGING_REFINEMENT: &str = "needs_messaging_refinement";

/// State key scanned for competitor mentions.
pub const RESEARCH_REPORT_KEY: &str = "research_report";
/// State key holding the messaging stage's quality score.
pub const MESSAGING_QUALITY_KEY: &str = "messaging_quality";

pub const COMPETITIVE_TRIGGER_TERMS: &[&str] =
    &["competitor", "competition", "rival", "market leader"];

/// Score assumed for a quality key that is absent or unreadable.
pub const DEFAULT_MISSING_SCORE: f64 = 0.5;

pub type Predicate = Arc<dyn Fn(&SharedState) -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// PredicateSpec
// ---------------------------------------------------------------------------

/// Declarative predicate definition, as written in pipeline config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum PredicateSpec {
    /// True iff the string at `key` contains any of `terms`, ignoring case.
    ContainsAny { key: String, terms: Vec<String> },
    /// True iff the quality score at `key` is strictly below `threshold`
    /// (default: the medium threshold).
    QualityBelow {
        key: String,
        #[serde(default)]
        threshold: Option<f64>,
        #[serde(default = "default_missing_score")]
        missing_score: f64,
    },
}

fn default_missing_score() -> f64 {
    DEFAULT_MISSING_SCORE
}

impl PredicateSpec {
    pub fn compile(&self, thresholds: &QualityThresholds) -> Result<Predicate> {
        match self {
            PredicateSpec::ContainsAny { key, terms } => contains_any(key, terms),
            PredicateSpec::QualityBelow {
                key,
                threshold,
                missing_score,
            } => {
                let gate = threshold.unwrap_or(thresholds.medium);
                for (what, value) in [("threshold", gate), ("missing_score", *missing_score)] {
                    if !(0.0..=1.0).contains(&value) {
                        return Err(CadenceError::InvalidConfiguration(format!(
                            "quality_below predicate on '{key}': {what} {value} is outside [0, 1]"
                        )));
                    }
                }
                Ok(quality_below(key, gate, *missing_score))
            }
        }
    }
}

/// Predicate matching any of `terms` in the string at `key`, case-insensitively.
///
/// Absent, empty and non-string values never match.
pub fn contains_any<S: AsRef<str>>(key: &str, terms: &[S]) -> Result<Predicate> {
    let alternatives: Vec<String> = terms
        .iter()
        .map(|t| t.as_ref().trim())
        .filter(|t| !t.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return Err(CadenceError::InvalidConfiguration(format!(
            "contains_any predicate on '{key}' has no terms"
        )));
    }
    let pattern = RegexBuilder::new(&alternatives.join("|"))
        .case_insensitive(true)
        .build()
        .map_err(|e| CadenceError::InvalidConfiguration(e.to_string()))?;
    let key = key.to_string();
    Ok(Arc::new(move |state: &SharedState| {
        state
            .get_str(&key)
            .is_some_and(|text| pattern.is_match(text))
    }))
}

/// Predicate true iff the quality score at `key` is below `gate`.
pub fn quality_below(key: &str, gate: f64, missing_score: f64) -> Predicate {
    let key = key.to_string();
    Arc::new(move |state: &SharedState| {
        let score = state
            .get(&key)
            .and_then(QualityScore::from_value)
            .map(|q| q.score)
            .unwrap_or(missing_score);
        score < gate
    })
}

// ---------------------------------------------------------------------------
// ConditionalRouter
// ---------------------------------------------------------------------------

/// Registry of named predicates plus the threshold table they gate against.
#[derive(Clone)]
pub struct ConditionalRouter {
    predicates: BTreeMap<String, Predicate>,
    thresholds: QualityThresholds,
}

impl ConditionalRouter {
    /// An empty router.
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self {
            predicates: BTreeMap::new(),
            thresholds,
        }
    }

    /// A router with the built-in content predicates registered.
    pub fn with_defaults(thresholds: QualityThresholds) -> Result<Self> {
        let mut router = Self::new(thresholds);
        router.register(
            NEEDS_COMPETITIVE_ANALYSIS,
            contains_any(RESEARCH_REPORT_KEY, COMPETITIVE_TRIGGER_TERMS)?,
        );
        router.register(
            NEEDS_MESSAGING_REFINEMENT,
            quality_below(MESSAGING_QUALITY_KEY, thresholds.medium, DEFAULT_MISSING_SCORE),
        );
        Ok(router)
    }

    /// Register (or replace) a predicate under `name`.
    pub fn register(&mut self, name: impl Into<String>, predicate: Predicate) {
        let name = name.into();
        tracing::debug!(predicate = %name, "Registering predicate");
        self.predicates.insert(name, predicate);
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&SharedState) -> bool + Send + Sync + 'static,
    {
        self.register(name, Arc::new(f));
    }

    pub fn register_spec(&mut self, name: impl Into<String>, spec: &PredicateSpec) -> Result<()> {
        let predicate = spec.compile(&self.thresholds)?;
        self.register(name, predicate);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.predicates.keys().map(String::as_str).collect()
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    pub fn evaluate(&self, name: &str, state: &SharedState) -> Result<bool> {
        let predicate = self
            .predicates
            .get(name)
            .ok_or_else(|| CadenceError::UnknownPredicate {
                name: name.to_string(),
            })?;
        Ok(predicate(state))
    }
}

impl std::fmt::Debug for ConditionalRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalRouter")
            .field("predicates", &self.names())
            .field("thresholds", &self.thresholds)
            .finish()
    }
}
