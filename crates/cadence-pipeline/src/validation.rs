//! Pipeline validation: lint rules and diagnostics.
//!
//! Call [`validate`] for advisory diagnostics or [`validate_or_raise`] to fail
//! on any `Error`-severity issue. [`validate_tools`] additionally checks stage
//! tool identifiers against a registry.

use std::collections::{HashMap, HashSet};

use cadence_tools::ToolRegistry;
use cadence_types::{quality_key, CadenceError, Result};

use crate::engine::Pipeline;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub phase: Option<String>,
    pub stage: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Diagnostic {
    fn new(rule: &str, severity: Severity, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity,
            message,
            phase: None,
            stage: None,
            fix: None,
        }
    }

    fn at(mut self, phase: &str, stage: Option<&str>) -> Self {
        self.phase = Some(phase.into());
        self.stage = stage.map(Into::into);
        self
    }

    fn fix(mut self, fix: String) -> Self {
        self.fix = Some(fix);
        self
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct NonEmptyRule;
impl LintRule for NonEmptyRule {
    fn name(&self) -> &str { "non_empty" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        if pipeline.phases().is_empty() {
            return vec![Diagnostic::new(
                self.name(),
                Severity::Warning,
                format!("Pipeline '{}' has no phases; a run only seeds state", pipeline.name()),
            )];
        }
        pipeline
            .phases()
            .iter()
            .filter(|p| p.phase.stages().is_empty())
            .map(|p| {
                Diagnostic::new(
                    self.name(),
                    Severity::Warning,
                    format!("Phase '{}' has no stages", p.phase.name()),
                )
                .at(p.phase.name(), None)
            })
            .collect()
    }
}

struct UniquePhaseNamesRule;
impl LintRule for UniquePhaseNamesRule {
    fn name(&self) -> &str { "unique_phase_names" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        pipeline
            .phases()
            .iter()
            .filter(|p| !seen.insert(p.phase.name()))
            .map(|p| {
                Diagnostic::new(
                    self.name(),
                    Severity::Warning,
                    format!("Phase name '{}' is used more than once", p.phase.name()),
                )
                .at(p.phase.name(), None)
            })
            .collect()
    }
}

struct UniqueStageNamesRule;
impl LintRule for UniqueStageNamesRule {
    fn name(&self) -> &str { "unique_stage_names" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        let mut diags = Vec::new();
        for p in pipeline.phases() {
            for stage in p.phase.stages() {
                if !seen.insert(stage.name()) {
                    diags.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Error,
                            format!("Stage name '{}' is used more than once", stage.name()),
                        )
                        .at(p.phase.name(), Some(stage.name()))
                        .fix("Give every stage a distinct name".into()),
                    );
                }
            }
        }
        diags
    }
}

struct UniqueOutputKeysRule;
impl LintRule for UniqueOutputKeysRule {
    fn name(&self) -> &str { "unique_output_keys" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut owners: HashMap<&str, &str> = HashMap::new();
        let mut diags = Vec::new();
        for p in pipeline.phases() {
            for stage in p.phase.stages() {
                let key = stage.output_key();
                if key == pipeline.seed_key() {
                    diags.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Error,
                            format!(
                                "Stage '{}' writes '{key}', which is the seed key",
                                stage.name()
                            ),
                        )
                        .at(p.phase.name(), Some(stage.name())),
                    );
                } else if let Some(owner) = owners.insert(key, stage.name()) {
                    diags.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Error,
                            format!(
                                "Stages '{owner}' and '{}' both write output key '{key}'",
                                stage.name()
                            ),
                        )
                        .at(p.phase.name(), Some(stage.name()))
                        .fix(format!("Rename the output key of '{}'", stage.name())),
                    );
                }
            }
        }
        diags
    }
}

struct StageSettingsRule;
impl LintRule for StageSettingsRule {
    fn name(&self) -> &str { "stage_settings" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for p in pipeline.phases() {
            for stage in p.phase.stages() {
                if let Err(e) = stage.validate() {
                    diags.push(
                        Diagnostic::new(self.name(), Severity::Error, e.to_string())
                            .at(p.phase.name(), Some(stage.name())),
                    );
                }
            }
        }
        diags
    }
}

/// Every required key must be seeded or produced by an earlier stage. A key
/// produced only inside a guarded phase is available only when that phase
/// ran, so consumers outside it get a warning.
struct DependencyOrderRule;
impl LintRule for DependencyOrderRule {
    fn name(&self) -> &str { "dependency_order" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let producers: HashMap<String, usize> = pipeline
            .phases()
            .iter()
            .enumerate()
            .flat_map(|(i, p)| p.phase.written_keys().into_iter().map(move |k| (k, i)))
            .collect();

        // key -> index of the phase that produced it; None for the seed key
        let mut available: HashMap<String, Option<usize>> = HashMap::new();
        available.insert(pipeline.seed_key().to_string(), None);

        let mut diags = Vec::new();
        for (i, p) in pipeline.phases().iter().enumerate() {
            for stage in p.phase.stages() {
                for key in stage.required_inputs() {
                    match available.get(key) {
                        None => {
                            let message = match producers.get(key) {
                                Some(_) => format!(
                                    "Stage '{}' requires '{key}', which is only produced later",
                                    stage.name()
                                ),
                                None => format!(
                                    "Stage '{}' requires '{key}', which no stage produces",
                                    stage.name()
                                ),
                            };
                            diags.push(
                                Diagnostic::new(self.name(), Severity::Error, message)
                                    .at(p.phase.name(), Some(stage.name()))
                                    .fix(format!(
                                        "Move '{}' after the stage that writes '{key}'",
                                        stage.name()
                                    )),
                            );
                        }
                        Some(Some(producer)) if *producer != i => {
                            let source = &pipeline.phases()[*producer];
                            if let Some(guard) = &source.guard {
                                diags.push(
                                    Diagnostic::new(
                                        "conditional_dependency",
                                        Severity::Warning,
                                        format!(
                                            "Stage '{}' requires '{key}', which is only written when guard '{guard}' lets phase '{}' run",
                                            stage.name(),
                                            source.phase.name()
                                        ),
                                    )
                                    .at(p.phase.name(), Some(stage.name())),
                                );
                            }
                        }
                        Some(_) => {}
                    }
                }
                available.insert(stage.output_key().to_string(), Some(i));
                available.insert(quality_key(stage.output_key()), Some(i));
            }
        }
        diags
    }
}

struct GuardRegisteredRule;
impl LintRule for GuardRegisteredRule {
    fn name(&self) -> &str { "guard_registered" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        pipeline
            .phases()
            .iter()
            .filter_map(|p| {
                let guard = p.guard.as_deref()?;
                if pipeline.router().contains(guard) {
                    return None;
                }
                Some(
                    Diagnostic::new(
                        self.name(),
                        Severity::Error,
                        format!(
                            "Phase '{}' is guarded by unregistered predicate '{guard}'",
                            p.phase.name()
                        ),
                    )
                    .at(p.phase.name(), None)
                    .fix(format!(
                        "Register '{guard}' or use one of: {}",
                        pipeline.router().names().join(", ")
                    )),
                )
            })
            .collect()
    }
}

fn built_in_rules() -> Vec<Box<dyn LintRule>> {
    vec![
        Box::new(NonEmptyRule),
        Box::new(UniquePhaseNamesRule),
        Box::new(UniqueStageNamesRule),
        Box::new(UniqueOutputKeysRule),
        Box::new(StageSettingsRule),
        Box::new(DependencyOrderRule),
        Box::new(GuardRegisteredRule),
    ]
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run every built-in lint rule.
pub fn validate(pipeline: &Pipeline) -> Vec<Diagnostic> {
    built_in_rules()
        .iter()
        .flat_map(|rule| rule.apply(pipeline))
        .collect()
}

/// Validate and fail with `InvalidConfiguration` if any error is found.
/// Returns the remaining (non-error) diagnostics on success.
pub fn validate_or_raise(pipeline: &Pipeline) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(pipeline);
    let errors: Vec<&Diagnostic> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if errors.is_empty() {
        for warning in &diagnostics {
            tracing::warn!(rule = %warning.rule, "{}", warning.message);
        }
        return Ok(diagnostics);
    }
    let messages: Vec<String> = errors
        .iter()
        .map(|d| format!("[{}] {}", d.rule, d.message))
        .collect();
    Err(CadenceError::InvalidConfiguration(messages.join("; ")))
}

/// Warn about stage tool identifiers with no capability in `registry`.
pub fn validate_tools(pipeline: &Pipeline, registry: &ToolRegistry) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    for p in pipeline.phases() {
        for stage in p.phase.stages() {
            for tool in stage.tools().iter().filter(|t| !registry.contains(t)) {
                diags.push(
                    Diagnostic::new(
                        "tool_registered",
                        Severity::Warning,
                        format!(
                            "Stage '{}' lists tool '{tool}', which is not registered",
                            stage.name()
                        ),
                    )
                    .at(p.phase.name(), Some(stage.name())),
                );
            }
        }
    }
    diags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Pipeline;
    use crate::phase::Phase;
    use crate::router::NEEDS_COMPETITIVE_ANALYSIS;
    use crate::stage::Stage;

    fn has(diags: &[Diagnostic], rule: &str, severity: Severity) -> bool {
        diags.iter().any(|d| d.rule == rule && d.severity == severity)
    }

    fn unchecked(builder: crate::engine::PipelineBuilder) -> Pipeline {
        builder.build_unchecked().unwrap()
    }

    #[test]
    fn valid_linear_pipeline_has_no_diagnostics() {
        let pipeline = unchecked(
            Pipeline::builder("content")
                .phase(Phase::new("research", "").with_stage(
                    Stage::new("research", "research_report").requires(["topic"]),
                ))
                .phase(Phase::new("messaging", "").with_stage(
                    Stage::new("messaging", "messaging").requires(["topic", "research_report"]),
                )),
        );
        let diags = validate(&pipeline);
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        assert!(validate_or_raise(&pipeline).is_ok());
    }

    #[test]
    fn requirement_produced_later_is_an_error() {
        let pipeline = unchecked(
            Pipeline::builder("p")
                .phase(Phase::new("one", "").with_stage(Stage::new("a", "a").requires(["b"])))
                .phase(Phase::new("two", "").with_stage(Stage::new("b", "b"))),
        );
        let diags = validate(&pipeline);
        let d = diags.iter().find(|d| d.rule == "dependency_order").unwrap();
        assert_eq!(d.severity, Severity::Error);
        assert!(d.message.contains("only produced later"));
        assert_eq!(d.stage.as_deref(), Some("a"));
    }

    #[test]
    fn requirement_never_produced_is_an_error() {
        let pipeline = unchecked(
            Pipeline::builder("p")
                .phase(Phase::new("one", "").with_stage(Stage::new("a", "a").requires(["ghost"]))),
        );
        let err = validate_or_raise(&pipeline).unwrap_err();
        assert!(err.to_string().contains("no stage produces"));
    }

    #[test]
    fn quality_keys_count_as_produced() {
        let pipeline = unchecked(
            Pipeline::builder("p")
                .phase(Phase::new("one", "").with_stage(Stage::new("a", "a")))
                .phase(Phase::new("two", "").with_stage(Stage::new("b", "b").requires(["a_quality"]))),
        );
        assert!(!has(&validate(&pipeline), "dependency_order", Severity::Error));
    }

    #[test]
    fn guarded_producer_yields_warning() {
        let pipeline = unchecked(
            Pipeline::builder("p")
                .guarded_phase(
                    Phase::new("competition", "").with_stage(Stage::new("c", "competitive_analysis")),
                    NEEDS_COMPETITIVE_ANALYSIS,
                )
                .phase(Phase::new("draft", "").with_stage(
                    Stage::new("d", "draft").requires(["competitive_analysis"]),
                )),
        );
        let diags = validate(&pipeline);
        assert!(has(&diags, "conditional_dependency", Severity::Warning));
        assert!(validate_or_raise(&pipeline).is_ok());
    }

    #[test]
    fn same_guarded_phase_dependency_is_fine() {
        let pipeline = unchecked(
            Pipeline::builder("p").guarded_phase(
                Phase::new("competition", "")
                    .with_stage(Stage::new("c", "competitive_analysis"))
                    .with_stage(Stage::new("s", "summary").requires(["competitive_analysis"])),
                NEEDS_COMPETITIVE_ANALYSIS,
            ),
        );
        assert!(validate(&pipeline).is_empty());
    }

    #[test]
    fn duplicate_stage_names_and_output_keys() {
        let pipeline = unchecked(
            Pipeline::builder("p").phase(
                Phase::new("one", "")
                    .with_stage(Stage::new("a", "out"))
                    .with_stage(Stage::new("a", "out")),
            ),
        );
        let diags = validate(&pipeline);
        assert!(has(&diags, "unique_stage_names", Severity::Error));
        assert!(has(&diags, "unique_output_keys", Severity::Error));
    }

    #[test]
    fn writing_the_seed_key_is_an_error() {
        let pipeline = unchecked(
            Pipeline::builder("p").phase(Phase::new("one", "").with_stage(Stage::new("a", "topic"))),
        );
        assert!(has(&validate(&pipeline), "unique_output_keys", Severity::Error));
    }

    #[test]
    fn unregistered_guard_is_an_error() {
        let pipeline = unchecked(
            Pipeline::builder("p").guarded_phase(
                Phase::new("one", "").with_stage(Stage::new("a", "a")),
                "needs_translation",
            ),
        );
        let diags = validate(&pipeline);
        let d = diags.iter().find(|d| d.rule == "guard_registered").unwrap();
        assert!(d.fix.as_deref().unwrap().contains(NEEDS_COMPETITIVE_ANALYSIS));
    }

    #[test]
    fn empty_pipeline_and_phase_warn() {
        let empty = unchecked(Pipeline::builder("p"));
        assert!(has(&validate(&empty), "non_empty", Severity::Warning));

        let hollow = unchecked(Pipeline::builder("p").phase(Phase::new("one", "")));
        let diags = validate(&hollow);
        assert!(has(&diags, "non_empty", Severity::Warning));
        assert!(validate_or_raise(&hollow).is_ok());
    }

    #[test]
    fn bad_stage_settings_reported() {
        let pipeline = unchecked(
            Pipeline::builder("p")
                .phase(Phase::new("one", "").with_stage(Stage::new("a", "a").with_threshold(2.0))),
        );
        assert!(has(&validate(&pipeline), "stage_settings", Severity::Error));
    }

    #[test]
    fn unknown_tools_warn() {
        let pipeline = unchecked(
            Pipeline::builder("p").phase(
                Phase::new("one", "").with_stage(Stage::new("a", "a").with_tools(["web_search"])),
            ),
        );
        let diags = validate_tools(&pipeline, &ToolRegistry::new());
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].rule, "tool_registered");
    }
}
