//! PipelineBuilder - 設定からステップ列を組み立てる
//!
//! 組み立ては起動時に一度だけ行い、おかしな設定はここで弾きます
//! （Fail-fast）。同じ設定からは常に同じ順序のステップ列ができます。

use std::sync::Arc;

use super::capability::{Capability, CapabilityPipeline};
use super::steps::{
    CodeGenerationStep, PlanningStep, RefinementStep, TemplateSeedingStep, ValidationStep,
};
use crate::domain::session::{InputMode, SessionConfig};
use crate::ports::{GenerationMode, GenerationService};

/// Upper bound on refinement iterations per session.
pub const MAX_REFINEMENT_ITERATIONS: u32 = 10;

/// BuildError は不正なセッション設定
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("template name must not be empty")]
    EmptyTemplateName,

    #[error("max_iterations {requested} exceeds limit {limit}")]
    TooManyIterations { requested: u32, limit: u32 },
}

/// PipelineBuilder はセッション設定からパイプラインを作る
///
/// 順序:
/// 1. planning（有効なら常に先頭）
/// 2. template_seeding（テンプレートモードのみ）
/// 3. code_generation（必ずひとつ）
/// 4. validation と refinement_1..N（検証が有効なときだけ）
pub struct PipelineBuilder {
    service: Arc<dyn GenerationService>,
    refinement_budget: u32,
}

impl PipelineBuilder {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self {
            service,
            refinement_budget: 10,
        }
    }

    /// Tool calls allowed per refinement iteration.
    pub fn refinement_budget(mut self, budget: u32) -> Self {
        self.refinement_budget = budget;
        self
    }

    pub fn build(&self, config: &SessionConfig) -> Result<CapabilityPipeline, BuildError> {
        if config.max_iterations > MAX_REFINEMENT_ITERATIONS {
            return Err(BuildError::TooManyIterations {
                requested: config.max_iterations,
                limit: MAX_REFINEMENT_ITERATIONS,
            });
        }

        let mut steps: Vec<Box<dyn Capability>> = Vec::new();

        if config.enable_planning {
            steps.push(Box::new(PlanningStep::new(self.service.clone())));
        }

        let mode = match &config.input_mode {
            InputMode::Template { name } => {
                if name.trim().is_empty() {
                    return Err(BuildError::EmptyTemplateName);
                }
                steps.push(Box::new(TemplateSeedingStep::new(name.clone())));
                GenerationMode::Template
            }
            InputMode::Scratch => GenerationMode::Scratch,
        };
        steps.push(Box::new(CodeGenerationStep::new(self.service.clone(), mode)));

        if config.enable_validation {
            let iterations = config.max_iterations;
            steps.push(Box::new(ValidationStep::new(
                self.service.clone(),
                iterations > 0,
            )));
            for i in 1..=iterations {
                steps.push(Box::new(RefinementStep::new(
                    self.service.clone(),
                    i,
                    iterations,
                    self.refinement_budget,
                )));
            }
        }

        Ok(CapabilityPipeline::new(steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::CapabilityResult;
    use crate::ports::StepRequest;
    use async_trait::async_trait;
    use rstest::rstest;

    struct Nothing;

    #[async_trait]
    impl GenerationService for Nothing {
        async fn run(&self, _request: StepRequest<'_>) -> CapabilityResult {
            CapabilityResult::success()
        }
    }

    fn builder() -> PipelineBuilder {
        PipelineBuilder::new(Arc::new(Nothing))
    }

    fn template(name: &str) -> InputMode {
        InputMode::Template {
            name: name.to_string(),
        }
    }

    #[rstest]
    #[case::minimal(false, InputMode::Scratch, false, 0, vec!["code_generation"])]
    #[case::planning(true, InputMode::Scratch, false, 0, vec!["planning", "code_generation"])]
    #[case::template(false, template("vite-react"), false, 0, vec!["template_seeding", "code_generation"])]
    #[case::validation_only(false, InputMode::Scratch, true, 0, vec!["code_generation", "validation"])]
    #[case::everything(
        true,
        template("vite-react"),
        true,
        2,
        vec!["planning", "template_seeding", "code_generation", "validation", "refinement_1", "refinement_2"]
    )]
    #[case::iterations_without_validation(false, InputMode::Scratch, false, 3, vec!["code_generation"])]
    fn step_order(
        #[case] enable_planning: bool,
        #[case] input_mode: InputMode,
        #[case] enable_validation: bool,
        #[case] max_iterations: u32,
        #[case] expected: Vec<&str>,
    ) {
        let config = SessionConfig {
            enable_planning,
            input_mode,
            enable_validation,
            max_iterations,
            preview: false,
        };
        let pipeline = builder().build(&config).unwrap();
        assert_eq!(pipeline.step_names(), expected);

        // Same config, same list.
        let again = builder().build(&config).unwrap();
        assert_eq!(again.step_names(), pipeline.step_names());
    }

    #[test]
    fn rejects_empty_template_name() {
        let config = SessionConfig {
            input_mode: template("  "),
            ..SessionConfig::default()
        };
        assert_eq!(builder().build(&config).unwrap_err(), BuildError::EmptyTemplateName);
    }

    #[test]
    fn rejects_too_many_iterations() {
        let config = SessionConfig {
            enable_validation: true,
            max_iterations: MAX_REFINEMENT_ITERATIONS + 1,
            ..SessionConfig::default()
        };
        assert!(matches!(
            builder().build(&config),
            Err(BuildError::TooManyIterations { requested, .. }) if requested == MAX_REFINEMENT_ITERATIONS + 1
        ));
    }
}
