//! Pluggable quality scoring for stage outputs.

use std::sync::Arc;

use cadence_types::{CadenceError, QualityScore, Result, SharedState};
use serde_json::Value;

/// Computes a [`QualityScore`] for the value a stage just wrote.
///
/// An `Err` is a scoring failure, which aborts the run; it is never treated
/// as a zero score.
pub trait Scorer: Send + Sync {
    fn score(&self, state: &SharedState, output_key: &str) -> Result<QualityScore>;
}

/// Character length of a state value: strings by their text, anything else by
/// its serialized JSON form.
pub fn output_length(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        other => other.to_string().chars().count(),
    }
}

// ---------------------------------------------------------------------------
// LengthScorer
// ---------------------------------------------------------------------------

/// Default scoring policy: `min(1.0, len / target_len)`, flagging outputs
/// shorter than `min_len`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LengthScorer {
    pub target_len: usize,
    pub min_len: usize,
}

impl Default for LengthScorer {
    fn default() -> Self {
        Self {
            target_len: 500,
            min_len: 100,
        }
    }
}

impl LengthScorer {
    pub fn score_value(&self, value: &Value) -> QualityScore {
        let len = output_length(value);
        let ratio = if self.target_len == 0 {
            1.0
        } else {
            len as f64 / self.target_len as f64
        };
        let mut score = QualityScore::new(ratio.min(1.0));
        if len < self.min_len {
            score = score.with_issue("output too short").with_suggestion(format!(
                "expand the output to at least {} characters (currently {len})",
                self.min_len
            ));
        }
        score
    }
}

impl Scorer for LengthScorer {
    fn score(&self, state: &SharedState, output_key: &str) -> Result<QualityScore> {
        let value = state
            .get(output_key)
            .ok_or_else(|| CadenceError::Other(format!("output key '{output_key}' is not set")))?;
        Ok(self.score_value(value))
    }
}

// ---------------------------------------------------------------------------
// FnScorer
// ---------------------------------------------------------------------------

/// Adapts a closure into a [`Scorer`].
#[derive(Clone)]
pub struct FnScorer {
    f: Arc<dyn Fn(&SharedState, &str) -> Result<QualityScore> + Send + Sync>,
}

impl FnScorer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&SharedState, &str) -> Result<QualityScore> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }
}

impl Scorer for FnScorer {
    fn score(&self, state: &SharedState, output_key: &str) -> Result<QualityScore> {
        (self.f)(state, output_key)
    }
}

impl std::fmt::Debug for FnScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnScorer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn length_score_is_linear_then_capped() {
        let scorer = LengthScorer::default();
        assert_eq!(scorer.score_value(&json!("a".repeat(250))).score, 0.5);
        assert_eq!(scorer.score_value(&json!("a".repeat(500))).score, 1.0);
        assert_eq!(scorer.score_value(&json!("a".repeat(5000))).score, 1.0);
        assert_eq!(scorer.score_value(&json!("")).score, 0.0);
    }

    #[test]
    fn length_score_is_monotone() {
        let scorer = LengthScorer::default();
        let mut last = -1.0;
        for len in (0..700).step_by(25) {
            let s = scorer.score_value(&json!("x".repeat(len))).score;
            assert!(s >= last, "score dropped at len {len}");
            last = s;
        }
    }

    #[test]
    fn short_output_flags_issue_and_suggestion() {
        let scorer = LengthScorer::default();
        let score = scorer.score_value(&json!("a".repeat(99)));
        assert_eq!(score.issues, vec!["output too short"]);
        assert_eq!(score.suggestions.len(), 1);

        let ok = scorer.score_value(&json!("a".repeat(100)));
        assert!(ok.issues.is_empty());
        assert!(ok.suggestions.is_empty());
    }

    #[test]
    fn forty_characters_scores_point_zero_eight() {
        let scorer = LengthScorer::default();
        let score = scorer.score_value(&json!("x".repeat(40)));
        assert!((score.score - 0.08).abs() < 1e-9);
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        assert_eq!(output_length(&json!("é".repeat(10))), 10);
    }

    #[test]
    fn structured_values_use_serialized_length() {
        let value = json!({"a": 1});
        assert_eq!(output_length(&value), r#"{"a":1}"#.len());
    }

    #[test]
    fn missing_output_is_an_error() {
        let scorer = LengthScorer::default();
        assert!(scorer.score(&SharedState::new(), "draft").is_err());
    }

    #[test]
    fn fn_scorer_delegates() {
        let scorer = FnScorer::new(|state, key| {
            let has = state.contains_key(key);
            Ok(QualityScore::new(if has { 1.0 } else { 0.0 }))
        });
        let state = SharedState::seeded("draft", "text");
        assert_eq!(scorer.score(&state, "draft").unwrap().score, 1.0);
        assert_eq!(scorer.score(&state, "other").unwrap().score, 0.0);
    }
}
