//! Per-attempt retry feedback and backoff between quality-gate attempts.

use std::time::Duration;

use cadence_types::QualityScore;

/// Feedback from one rejected attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryContext {
    /// Zero-based index of the attempt this feedback describes.
    pub attempt: u32,
    pub score: QualityScore,
}

/// Base instruction followed by the feedback from every rejected attempt so far.
///
/// The base text is never modified; with no feedback it is returned as is.
pub fn effective_instruction(base: &str, feedback: &[RetryContext]) -> String {
    if feedback.is_empty() {
        return base.to_string();
    }

    let mut out = String::from(base);
    out.push_str("\n\nFeedback on previous attempts:");
    for ctx in feedback {
        out.push_str(&format!(
            "\n\nAttempt {} scored {:.2}.",
            ctx.attempt + 1,
            ctx.score.score
        ));
        if !ctx.score.issues.is_empty() {
            out.push_str("\nIssues:");
            for issue in &ctx.score.issues {
                out.push_str(&format!("\n- {issue}"));
            }
        }
        if !ctx.score.suggestions.is_empty() {
            out.push_str("\nSuggestions:");
            for suggestion in &ctx.score.suggestions {
                out.push_str(&format!("\n- {suggestion}"));
            }
        }
    }
    out
}

/// Delay inserted before re-invoking a stage whose attempt was rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum BackoffPolicy {
    /// Fixed delay between attempts.
    Fixed(Duration),
    /// base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    #[default]
    None,
}

impl BackoffPolicy {
    /// Delay after the given zero-based attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = u64::try_from(base.as_millis())
                    .unwrap_or(u64::MAX)
                    .saturating_mul(2u64.saturating_pow(attempt));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_uses_base_instruction() {
        assert_eq!(effective_instruction("Write a tagline.", &[]), "Write a tagline.");
    }

    #[test]
    fn feedback_accumulates_in_order() {
        let feedback = vec![
            RetryContext {
                attempt: 0,
                score: QualityScore::new(0.08)
                    .with_issue("output too short")
                    .with_suggestion("add detail"),
            },
            RetryContext {
                attempt: 1,
                score: QualityScore::new(0.3),
            },
        ];
        let text = effective_instruction("Write a tagline.", &feedback);
        assert!(text.starts_with("Write a tagline.\n\nFeedback on previous attempts:"));
        assert!(text.contains("Attempt 1 scored 0.08."));
        assert!(text.contains("- output too short"));
        assert!(text.contains("- add detail"));
        let first = text.find("Attempt 1").unwrap();
        let second = text.find("Attempt 2 scored 0.30.").unwrap();
        assert!(first < second);
    }

    #[test]
    fn default_backoff_is_none() {
        assert_eq!(BackoffPolicy::default(), BackoffPolicy::None);
        assert_eq!(BackoffPolicy::None.delay_for_attempt(7), Duration::ZERO);
    }

    #[test]
    fn fixed_backoff_constant_delay() {
        let policy = BackoffPolicy::Fixed(Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(200));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(500));
    }

    #[test]
    fn exponential_backoff_saturates_on_huge_base() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_secs(u64::MAX),
            max: Duration::MAX,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(u64::MAX));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(u64::MAX));
    }
}
