//! The shipped content-generation pipeline.

use cadence_types::Result;

use crate::config::PipelineConfig;
use crate::engine::Pipeline;

/// Source of `pipelines/content.json`.
pub const CONTENT_PIPELINE_JSON: &str = include_str!("../../../pipelines/content.json");

/// research → competitive analysis (guarded) → messaging → messaging
/// refinement (guarded) → content draft.
pub fn content_pipeline() -> Result<Pipeline> {
    content_pipeline_config()?.into_pipeline()
}

pub fn content_pipeline_config() -> Result<PipelineConfig> {
    PipelineConfig::from_json_str(CONTENT_PIPELINE_JSON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{NEEDS_COMPETITIVE_ANALYSIS, NEEDS_MESSAGING_REFINEMENT};
    use crate::validation::validate;

    #[test]
    fn content_pipeline_builds_cleanly() {
        let pipeline = content_pipeline().unwrap();
        assert_eq!(pipeline.name(), "content");
        assert_eq!(pipeline.seed_key(), "topic");
        assert!(validate(&pipeline).is_empty());
    }

    #[test]
    fn phase_order_and_guards() {
        let pipeline = content_pipeline().unwrap();
        let layout: Vec<(&str, Option<&str>)> = pipeline
            .phases()
            .iter()
            .map(|p| (p.phase.name(), p.guard.as_deref()))
            .collect();
        assert_eq!(
            layout,
            vec![
                ("research", None),
                ("competitive_analysis", Some(NEEDS_COMPETITIVE_ANALYSIS)),
                ("messaging", None),
                ("messaging_refinement", Some(NEEDS_MESSAGING_REFINEMENT)),
                ("content", None),
            ]
        );
    }

    #[test]
    fn research_feeds_the_competitive_predicate() {
        let pipeline = content_pipeline().unwrap();
        let research = &pipeline.phases()[0].phase.stages()[0];
        assert_eq!(research.output_key(), crate::router::RESEARCH_REPORT_KEY);
        assert_eq!(research.tools(), ["web_search"]);
    }
}
