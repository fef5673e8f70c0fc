//! Capability context and per-step results.
//!
//! The context is owned by the pipeline executing one session. Each step's
//! result is folded into it exactly once and then discarded.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::ids::SessionId;
use super::session::TokenUsage;

/// Output of the planning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitecturePlan {
    pub summary: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Output of the validation step (and of each refinement iteration).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub passed: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn passed() -> Self {
        Self {
            passed: true,
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            passed: false,
            errors,
        }
    }
}

/// Context fields a step may update. Each field is merged explicitly;
/// `None` leaves the current value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextUpdates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ArchitecturePlan>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationOutcome>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement_iterations: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_seeded: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_generated: Option<bool>,
}

impl ContextUpdates {
    pub fn is_empty(&self) -> bool {
        self.plan.is_none()
            && self.validation.is_none()
            && self.refinement_iterations.is_none()
            && self.template_seeded.is_none()
            && self.files_generated.is_none()
    }
}

/// Result of one capability execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResult {
    pub success: bool,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub tool_calls: u32,
    #[serde(default)]
    pub updates: ContextUpdates,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CapabilityResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, tokens: TokenUsage, cost_usd: f64, tool_calls: u32) -> Self {
        self.tokens = tokens;
        self.cost_usd = cost_usd;
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_updates(mut self, updates: ContextUpdates) -> Self {
        self.updates = updates;
        self
    }
}

/// Shared state threaded through the pipeline for one session.
#[derive(Debug, Clone)]
pub struct CapabilityContext {
    pub session_id: SessionId,
    pub prompt: String,
    pub workspace_path: PathBuf,

    /// Running totals. Only ever increased.
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub tool_calls: u32,
    pub steps_completed: u32,

    pub started_at: DateTime<Utc>,

    /// Once cancelled, stays cancelled.
    pub cancellation: CancellationToken,

    pub plan: Option<ArchitecturePlan>,
    pub validation: Option<ValidationOutcome>,
    pub refinement_iterations: u32,
    pub template_seeded: bool,
    pub files_generated: bool,
}

impl CapabilityContext {
    pub fn new(
        session_id: SessionId,
        prompt: impl Into<String>,
        workspace_path: PathBuf,
        started_at: DateTime<Utc>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            prompt: prompt.into(),
            workspace_path,
            tokens: TokenUsage::default(),
            cost_usd: 0.0,
            tool_calls: 0,
            steps_completed: 0,
            started_at,
            cancellation,
            plan: None,
            validation: None,
            refinement_iterations: 0,
            template_seeded: false,
            files_generated: false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Fold a successful step's result into the context.
    ///
    /// Usage deltas are additive. Context updates are merged field by field
    /// so an update from a later step never wipes an earlier one.
    pub fn merge(&mut self, result: &CapabilityResult) {
        self.tokens += result.tokens;
        if result.cost_usd.is_finite() && result.cost_usd > 0.0 {
            self.cost_usd += result.cost_usd;
        }
        self.tool_calls = self.tool_calls.saturating_add(result.tool_calls);
        self.steps_completed = self.steps_completed.saturating_add(1);

        let updates = &result.updates;
        if let Some(plan) = &updates.plan {
            self.plan = Some(plan.clone());
        }
        if let Some(validation) = &updates.validation {
            self.validation = Some(validation.clone());
        }
        if let Some(iterations) = updates.refinement_iterations {
            self.refinement_iterations = self.refinement_iterations.max(iterations);
        }
        if let Some(seeded) = updates.template_seeded {
            self.template_seeded = self.template_seeded || seeded;
        }
        if let Some(generated) = updates.files_generated {
            self.files_generated = self.files_generated || generated;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn ctx() -> CapabilityContext {
        CapabilityContext::new(
            SessionId::from_ulid(Ulid::new()),
            "build a todo app",
            PathBuf::from("/tmp/ws"),
            Utc::now(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn merge_is_additive() {
        let mut c = ctx();
        c.merge(&CapabilityResult::success().with_usage(TokenUsage::new(100, 50), 0.002, 3));
        c.merge(&CapabilityResult::success().with_usage(TokenUsage::new(10, 20), 0.001, 1));

        assert_eq!(c.tokens, TokenUsage::new(110, 70));
        assert!((c.cost_usd - 0.003).abs() < 1e-9);
        assert_eq!(c.tool_calls, 4);
        assert_eq!(c.steps_completed, 2);
    }

    #[test]
    fn merge_keeps_earlier_updates() {
        let mut c = ctx();
        let plan = ArchitecturePlan {
            summary: "spa".to_string(),
            files: vec!["src/App.tsx".to_string()],
        };
        c.merge(&CapabilityResult::success().with_updates(ContextUpdates {
            plan: Some(plan.clone()),
            ..ContextUpdates::default()
        }));
        c.merge(&CapabilityResult::success().with_updates(ContextUpdates {
            validation: Some(ValidationOutcome::passed()),
            ..ContextUpdates::default()
        }));

        assert_eq!(c.plan, Some(plan));
        assert_eq!(c.validation, Some(ValidationOutcome::passed()));
    }

    #[test]
    fn merge_ignores_negative_cost() {
        let mut c = ctx();
        c.merge(&CapabilityResult::success().with_usage(TokenUsage::default(), -1.0, 0));
        assert_eq!(c.cost_usd, 0.0);
    }

    #[test]
    fn refinement_count_never_goes_backwards() {
        let mut c = ctx();
        c.merge(&CapabilityResult::success().with_updates(ContextUpdates {
            refinement_iterations: Some(2),
            ..ContextUpdates::default()
        }));
        c.merge(&CapabilityResult::success().with_updates(ContextUpdates {
            refinement_iterations: Some(1),
            ..ContextUpdates::default()
        }));
        assert_eq!(c.refinement_iterations, 2);
    }

    #[test]
    fn cancellation_is_shared_with_clones() {
        let c = ctx();
        let token = c.cancellation.clone();
        token.cancel();
        token.cancel();
        assert!(c.is_cancelled());
    }
}
