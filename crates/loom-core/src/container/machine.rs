//! Container lifecycle state machine (pure part).
//!
//! ```text
//! idle -> creating -> ready -> installing -> starting -> waitingForVite
//!      -> checkingHttpReady -> running -> (STOP_SERVER) ready
//! ```
//! Failures and timeouts in the busy states go to `failed`. `DESTROY` from any
//! non-terminal state goes to `stopped`. Side effects live in `manager`.

use serde::{Deserialize, Serialize};

use crate::domain::events::ContainerStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ContainerState {
    Idle,
    Creating,
    Ready,
    Installing,
    Starting,
    WaitingForVite,
    CheckingHttpReady,
    Running,
    Stopped,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    Create,
    Created,
    InstallDeps,
    Installed,
    Started,
    ViteReady,
    HttpReady,
    StopServer,
    Destroy,
    /// Failure or timeout of the operation running in the current state.
    Fail { error: String },
}

impl ContainerEvent {
    pub fn fail(error: impl Into<String>) -> Self {
        ContainerEvent::Fail {
            error: error.into(),
        }
    }
}

impl ContainerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerState::Stopped | ContainerState::Failed { .. })
    }

    /// States that own the dev-server log stream.
    pub fn has_dev_server(&self) -> bool {
        matches!(
            self,
            ContainerState::WaitingForVite
                | ContainerState::CheckingHttpReady
                | ContainerState::Running
        )
    }

    /// Externally visible status. The dev-server start-up states all report `Starting`.
    pub fn status(&self) -> ContainerStatus {
        match self {
            ContainerState::Idle => ContainerStatus::Idle,
            ContainerState::Creating => ContainerStatus::Creating,
            ContainerState::Ready => ContainerStatus::Ready,
            ContainerState::Installing => ContainerStatus::Installing,
            ContainerState::Starting
            | ContainerState::WaitingForVite
            | ContainerState::CheckingHttpReady => ContainerStatus::Starting,
            ContainerState::Running => ContainerStatus::Running,
            ContainerState::Stopped => ContainerStatus::Stopped,
            ContainerState::Failed { .. } => ContainerStatus::Failed,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContainerState::Idle => "idle",
            ContainerState::Creating => "creating",
            ContainerState::Ready => "ready",
            ContainerState::Installing => "installing",
            ContainerState::Starting => "starting",
            ContainerState::WaitingForVite => "waitingForVite",
            ContainerState::CheckingHttpReady => "checkingHttpReady",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::Failed { .. } => "failed",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ContainerState::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// `None` means the event is not accepted in this state.
pub fn transition(state: &ContainerState, event: &ContainerEvent) -> Option<ContainerState> {
    use ContainerEvent as E;
    use ContainerState as S;

    if state.is_terminal() {
        return None;
    }

    let next = match (state, event) {
        (_, E::Destroy) => S::Stopped,

        (S::Idle, E::Create) => S::Creating,
        (S::Creating, E::Created) => S::Ready,
        (S::Ready, E::InstallDeps) => S::Installing,
        (S::Installing, E::Installed) => S::Starting,
        (S::Starting, E::Started) => S::WaitingForVite,
        (S::WaitingForVite, E::ViteReady) => S::CheckingHttpReady,
        (S::CheckingHttpReady, E::HttpReady) => S::Running,
        (S::Running, E::StopServer) => S::Ready,

        (
            S::Creating | S::Installing | S::Starting | S::WaitingForVite | S::CheckingHttpReady,
            E::Fail { error },
        ) => S::Failed {
            error: error.clone(),
        },

        _ => return None,
    };
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn all_states() -> Vec<ContainerState> {
        vec![
            ContainerState::Idle,
            ContainerState::Creating,
            ContainerState::Ready,
            ContainerState::Installing,
            ContainerState::Starting,
            ContainerState::WaitingForVite,
            ContainerState::CheckingHttpReady,
            ContainerState::Running,
            ContainerState::Stopped,
            ContainerState::Failed {
                error: "boom".into(),
            },
        ]
    }

    #[test]
    fn happy_path_reaches_running_and_back_to_ready() {
        let events = [
            ContainerEvent::Create,
            ContainerEvent::Created,
            ContainerEvent::InstallDeps,
            ContainerEvent::Installed,
            ContainerEvent::Started,
            ContainerEvent::ViteReady,
            ContainerEvent::HttpReady,
            ContainerEvent::StopServer,
        ];
        let mut state = ContainerState::Idle;
        for e in &events {
            state = transition(&state, e).unwrap();
        }
        assert_eq!(state, ContainerState::Ready);
    }

    #[test]
    fn destroy_from_every_live_state_stops() {
        for state in all_states() {
            let next = transition(&state, &ContainerEvent::Destroy);
            if state.is_terminal() {
                assert_eq!(next, None);
            } else {
                assert_eq!(next, Some(ContainerState::Stopped), "from {}", state.name());
            }
        }
    }

    #[rstest]
    #[case::creating(ContainerState::Creating, true)]
    #[case::installing(ContainerState::Installing, true)]
    #[case::starting(ContainerState::Starting, true)]
    #[case::waiting(ContainerState::WaitingForVite, true)]
    #[case::checking(ContainerState::CheckingHttpReady, true)]
    #[case::idle(ContainerState::Idle, false)]
    #[case::ready(ContainerState::Ready, false)]
    #[case::running(ContainerState::Running, false)]
    fn failures_only_in_busy_states(#[case] state: ContainerState, #[case] fails: bool) {
        let next = transition(&state, &ContainerEvent::fail("Timeout waiting for Vite to be ready"));
        if fails {
            assert_eq!(
                next.as_ref().and_then(|s| s.error()),
                Some("Timeout waiting for Vite to be ready")
            );
        } else {
            assert_eq!(next, None);
        }
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        assert_eq!(transition(&ContainerState::Idle, &ContainerEvent::InstallDeps), None);
        assert_eq!(transition(&ContainerState::Creating, &ContainerEvent::InstallDeps), None);
        assert_eq!(transition(&ContainerState::Ready, &ContainerEvent::StopServer), None);
    }

    #[test]
    fn startup_states_project_to_starting() {
        for state in [
            ContainerState::Starting,
            ContainerState::WaitingForVite,
            ContainerState::CheckingHttpReady,
        ] {
            assert_eq!(state.status(), ContainerStatus::Starting);
        }
        assert_eq!(ContainerState::Running.status(), ContainerStatus::Running);
    }
}
