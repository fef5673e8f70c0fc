//! Concrete capabilities.
//!
//! Each step delegates the actual generation work to the injected
//! [`GenerationService`]. The steps themselves only decide ordering,
//! prerequisites and which context fields the result updates.

use std::sync::Arc;

use async_trait::async_trait;

use super::capability::{Capability, Stage};
use crate::domain::context::{
    CapabilityContext, CapabilityResult, ContextUpdates, ValidationOutcome,
};
use crate::ports::{GenerationMode, GenerationService, StepKind, StepRequest};
use crate::workspace::SandboxedWorkspace;

/// Architectural planning. Always first when enabled.
pub struct PlanningStep {
    service: Arc<dyn GenerationService>,
}

impl PlanningStep {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Capability for PlanningStep {
    fn name(&self) -> &str {
        "planning"
    }

    fn stage(&self) -> Stage {
        Stage::Prepare
    }

    fn can_skip(&self, ctx: &CapabilityContext) -> bool {
        ctx.plan.is_some()
    }

    fn validate_context(&self, ctx: &CapabilityContext) -> Result<(), String> {
        if ctx.prompt.trim().is_empty() {
            return Err("prompt is empty".to_string());
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &CapabilityContext,
        workspace: &SandboxedWorkspace,
    ) -> CapabilityResult {
        self.service
            .run(StepRequest {
                kind: StepKind::Planning,
                context: ctx,
                workspace,
                tool_call_budget: None,
            })
            .await
    }
}

/// Copies a whitelisted template tree into the workspace.
pub struct TemplateSeedingStep {
    template: String,
}

impl TemplateSeedingStep {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl Capability for TemplateSeedingStep {
    fn name(&self) -> &str {
        "template_seeding"
    }

    fn stage(&self) -> Stage {
        Stage::Template
    }

    fn can_skip(&self, ctx: &CapabilityContext) -> bool {
        ctx.template_seeded
    }

    async fn execute(
        &self,
        _ctx: &CapabilityContext,
        workspace: &SandboxedWorkspace,
    ) -> CapabilityResult {
        match workspace.seed_template(&self.template).await {
            Ok(_) => CapabilityResult::success().with_updates(ContextUpdates {
                template_seeded: Some(true),
                ..ContextUpdates::default()
            }),
            Err(e) => CapabilityResult::failure(e.to_string()),
        }
    }
}

/// The primary generation step. Exactly one per pipeline.
pub struct CodeGenerationStep {
    service: Arc<dyn GenerationService>,
    mode: GenerationMode,
}

impl CodeGenerationStep {
    pub fn new(service: Arc<dyn GenerationService>, mode: GenerationMode) -> Self {
        Self { service, mode }
    }
}

#[async_trait]
impl Capability for CodeGenerationStep {
    fn name(&self) -> &str {
        "code_generation"
    }

    fn stage(&self) -> Stage {
        Stage::Generate
    }

    fn validate_context(&self, ctx: &CapabilityContext) -> Result<(), String> {
        if self.mode == GenerationMode::Template && !ctx.template_seeded {
            return Err("template has not been seeded".to_string());
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &CapabilityContext,
        workspace: &SandboxedWorkspace,
    ) -> CapabilityResult {
        let mut result = self
            .service
            .run(StepRequest {
                kind: StepKind::Generation { mode: self.mode },
                context: ctx,
                workspace,
                tool_call_budget: None,
            })
            .await;
        if result.success {
            result.updates.files_generated = Some(true);
        }
        result
    }
}

/// Compiler and type checks over the generated files.
///
/// With refinement iterations configured, a failed check is recorded in the
/// context and left for the refinement steps. Without them it halts the
/// pipeline.
pub struct ValidationStep {
    service: Arc<dyn GenerationService>,
    tolerate_failure: bool,
}

impl ValidationStep {
    pub fn new(service: Arc<dyn GenerationService>, tolerate_failure: bool) -> Self {
        Self {
            service,
            tolerate_failure,
        }
    }
}

#[async_trait]
impl Capability for ValidationStep {
    fn name(&self) -> &str {
        "validation"
    }

    fn stage(&self) -> Stage {
        Stage::Generate
    }

    fn validate_context(&self, ctx: &CapabilityContext) -> Result<(), String> {
        if !ctx.files_generated {
            return Err("no generated files to validate".to_string());
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &CapabilityContext,
        workspace: &SandboxedWorkspace,
    ) -> CapabilityResult {
        let mut result = self
            .service
            .run(StepRequest {
                kind: StepKind::Validation,
                context: ctx,
                workspace,
                tool_call_budget: None,
            })
            .await;

        if result.success {
            let outcome = result.updates.validation.get_or_insert_with(ValidationOutcome::passed);
            if !outcome.passed && !self.tolerate_failure {
                let errors = if outcome.errors.is_empty() {
                    "validation reported failure".to_string()
                } else {
                    outcome.errors.join("; ")
                };
                result.success = false;
                result.error = Some(errors);
            }
            return result;
        }
        if !self.tolerate_failure {
            return result;
        }

        let error = result.error.take().unwrap_or_default();
        tracing::info!(session_id = %ctx.session_id, error = %error, "validation failed, refinement pending");
        result.success = true;
        result.updates.validation = Some(ValidationOutcome::failed(vec![error]));
        result
    }
}

/// One tool-call-budgeted error-fixing pass.
///
/// Skipped once validation passes. The last iteration fails the pipeline if
/// the errors are still there.
pub struct RefinementStep {
    service: Arc<dyn GenerationService>,
    name: String,
    iteration: u32,
    total: u32,
    budget: u32,
}

impl RefinementStep {
    pub fn new(service: Arc<dyn GenerationService>, iteration: u32, total: u32, budget: u32) -> Self {
        Self {
            service,
            name: format!("refinement_{iteration}"),
            iteration,
            total,
            budget,
        }
    }
}

#[async_trait]
impl Capability for RefinementStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> Stage {
        Stage::Generate
    }

    fn can_skip(&self, ctx: &CapabilityContext) -> bool {
        ctx.validation.as_ref().is_some_and(|v| v.passed)
    }

    fn validate_context(&self, ctx: &CapabilityContext) -> Result<(), String> {
        if ctx.validation.is_none() {
            return Err("validation has not run".to_string());
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &CapabilityContext,
        workspace: &SandboxedWorkspace,
    ) -> CapabilityResult {
        let mut result = self
            .service
            .run(StepRequest {
                kind: StepKind::Refinement {
                    iteration: self.iteration,
                },
                context: ctx,
                workspace,
                tool_call_budget: Some(self.budget),
            })
            .await;
        if !result.success {
            return result;
        }

        result.updates.refinement_iterations = Some(self.iteration);
        let outcome = result.updates.validation.as_ref().or(ctx.validation.as_ref());
        let still_failing = outcome.is_some_and(|v| !v.passed);
        if still_failing && self.iteration >= self.total {
            let errors = outcome.map(|v| v.errors.join("; ")).unwrap_or_default();
            result.success = false;
            result.error = Some(format!(
                "validation still failing after {} refinement iteration(s): {errors}",
                self.total
            ));
        }
        result
    }
}
