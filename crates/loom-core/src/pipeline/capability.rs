//! Capability trait and the ordered pipeline that runs them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::context::{CapabilityContext, CapabilityResult};
use crate::domain::errors::PipelineError;
use crate::workspace::SandboxedWorkspace;

/// Which lifecycle phase a step belongs to.
///
/// The generation lifecycle runs one stage per state:
/// `initializing` → `Prepare`, `loadingTemplate` → `Template`,
/// `codeGenerating` → `Generate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Template,
    Generate,
}

/// One unit of generation work.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn stage(&self) -> Stage;

    fn can_skip(&self, _ctx: &CapabilityContext) -> bool {
        false
    }

    /// Check the context fields this step needs. `Err` carries the reason.
    fn validate_context(&self, _ctx: &CapabilityContext) -> Result<(), String> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &CapabilityContext,
        workspace: &SandboxedWorkspace,
    ) -> CapabilityResult;
}

/// Which steps ran and which were skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Ordered list of steps. Built by `PipelineBuilder`.
pub struct CapabilityPipeline {
    steps: Vec<Box<dyn Capability>>,
}

impl std::fmt::Debug for CapabilityPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityPipeline")
            .field("steps", &self.step_names())
            .finish()
    }
}

impl CapabilityPipeline {
    pub fn new(steps: Vec<Box<dyn Capability>>) -> Self {
        Self { steps }
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn has_stage(&self, stage: Stage) -> bool {
        self.steps.iter().any(|s| s.stage() == stage)
    }

    /// Run every step in order.
    pub async fn execute(
        &self,
        ctx: &mut CapabilityContext,
        workspace: &SandboxedWorkspace,
    ) -> Result<StageReport, PipelineError> {
        let mut report = StageReport::default();
        for stage in [Stage::Prepare, Stage::Template, Stage::Generate] {
            let stage_report = self.execute_stage(stage, ctx, workspace).await?;
            report.executed.extend(stage_report.executed);
            report.skipped.extend(stage_report.skipped);
        }
        Ok(report)
    }

    /// Run the steps of one stage in order.
    ///
    /// Halts on cancellation (checked before each step), on a failed context
    /// check and on a failed step. Successful results are merged into `ctx`.
    pub async fn execute_stage(
        &self,
        stage: Stage,
        ctx: &mut CapabilityContext,
        workspace: &SandboxedWorkspace,
    ) -> Result<StageReport, PipelineError> {
        let mut report = StageReport::default();

        for step in self.steps.iter().filter(|s| s.stage() == stage) {
            let name = step.name();
            if ctx.is_cancelled() {
                tracing::info!(session_id = %ctx.session_id, step = name, "pipeline cancelled");
                return Err(PipelineError::Cancelled);
            }
            if step.can_skip(ctx) {
                tracing::debug!(session_id = %ctx.session_id, step = name, "step skipped");
                report.skipped.push(name.to_string());
                continue;
            }
            if let Err(message) = step.validate_context(ctx) {
                return Err(PipelineError::Validation {
                    step: name.to_string(),
                    message,
                });
            }

            tracing::debug!(session_id = %ctx.session_id, step = name, "step started");
            let result = step.execute(ctx, workspace).await;
            if !result.success {
                let message = result
                    .error
                    .unwrap_or_else(|| "step reported failure".to_string());
                tracing::warn!(session_id = %ctx.session_id, step = name, error = %message, "step failed");
                return Err(PipelineError::StepFailed {
                    step: name.to_string(),
                    message,
                });
            }

            ctx.merge(&result);
            tracing::debug!(
                session_id = %ctx.session_id,
                step = name,
                total_tokens = ctx.tokens.total(),
                "step completed"
            );
            report.executed.push(name.to_string());
        }
        Ok(report)
    }
}
