//! Generation lifecycle state machine (pure part).
//!
//! ```text
//! idle -> initializing -> [loadingTemplate] -> codeGenerating -> completing -> completed
//!                       \______________ any step failure ______/-> completingFailed -> failed
//!                        \_____________ ABORT _________________/-> completingCancelled -> cancelled
//! ```
//! The `completing*` states run the finish action; their outcome is already
//! decided, so `Abort` and failures are ignored there.

use serde::{Deserialize, Serialize};

use crate::domain::session::SessionStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GenerationState {
    Idle,
    Initializing,
    LoadingTemplate,
    CodeGenerating,
    Completing,
    CompletingFailed { error: String },
    CompletingCancelled,
    Completed,
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Start,
    /// Preparation finished. `template` selects the template-loading branch.
    Initialized { template: bool },
    TemplateLoaded,
    CodeGenerated,
    StepFailed { error: String },
    TimedOut { error: String },
    Abort,
    /// The finish action has run.
    Finished,
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationState::Completed | GenerationState::Failed { .. } | GenerationState::Cancelled
        )
    }

    pub fn is_completing(&self) -> bool {
        matches!(
            self,
            GenerationState::Completing
                | GenerationState::CompletingFailed { .. }
                | GenerationState::CompletingCancelled
        )
    }

    /// States that run a pipeline stage.
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            GenerationState::Initializing
                | GenerationState::LoadingTemplate
                | GenerationState::CodeGenerating
        )
    }

    pub fn status(&self) -> SessionStatus {
        match self {
            GenerationState::Idle => SessionStatus::Pending,
            GenerationState::Completed => SessionStatus::Completed,
            GenerationState::Failed { .. } => SessionStatus::Failed,
            GenerationState::Cancelled => SessionStatus::Cancelled,
            _ => SessionStatus::Generating,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GenerationState::Idle => "idle",
            GenerationState::Initializing => "initializing",
            GenerationState::LoadingTemplate => "loadingTemplate",
            GenerationState::CodeGenerating => "codeGenerating",
            GenerationState::Completing => "completing",
            GenerationState::CompletingFailed { .. } => "completingFailed",
            GenerationState::CompletingCancelled => "completingCancelled",
            GenerationState::Completed => "completed",
            GenerationState::Failed { .. } => "failed",
            GenerationState::Cancelled => "cancelled",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            GenerationState::CompletingFailed { error } | GenerationState::Failed { error } => {
                Some(error)
            }
            _ => None,
        }
    }
}

/// `None` means the event is not accepted in this state.
pub fn transition(state: &GenerationState, event: &GenerationEvent) -> Option<GenerationState> {
    use GenerationEvent as E;
    use GenerationState as S;

    if state.is_terminal() {
        return None;
    }

    let next = match (state, event) {
        (S::Idle, E::Start) => S::Initializing,

        (S::Initializing, E::Initialized { template: true }) => S::LoadingTemplate,
        (S::Initializing, E::Initialized { template: false }) => S::CodeGenerating,
        (S::LoadingTemplate, E::TemplateLoaded) => S::CodeGenerating,
        (S::CodeGenerating, E::CodeGenerated) => S::Completing,

        (s, E::StepFailed { error } | E::TimedOut { error }) if s.is_working() => {
            S::CompletingFailed {
                error: error.clone(),
            }
        }
        (s, E::Abort) if !s.is_completing() => S::CompletingCancelled,

        (S::Completing, E::Finished) => S::Completed,
        (S::CompletingFailed { error }, E::Finished) => S::Failed {
            error: error.clone(),
        },
        (S::CompletingCancelled, E::Finished) => S::Cancelled,

        _ => return None,
    };
    Some(next)
}
