//! Session model: request, configuration, status and metrics.
//!
//! A session is created when a request arrives and becomes immutable once it
//! reaches a terminal status. Only the generation lifecycle and the
//! orchestrator's error handlers mutate it.

use std::ops::{Add, AddAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::SessionId;

/// Session status as persisted and reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Generating,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Is this a terminal status (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Generating => "generating",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the primary generation step gets its starting point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InputMode {
    /// Seed the workspace from a whitelisted template, then generate on top of it.
    Template { name: String },
    /// Generate everything from an empty workspace.
    Scratch,
}

impl InputMode {
    pub fn template_name(&self) -> Option<&str> {
        match self {
            InputMode::Template { name } => Some(name),
            InputMode::Scratch => None,
        }
    }
}

/// Which capabilities are enabled for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Run the architectural planning step first.
    #[serde(default)]
    pub enable_planning: bool,

    #[serde(default = "default_input_mode")]
    pub input_mode: InputMode,

    /// Run compiler/type checks after generation.
    #[serde(default)]
    pub enable_validation: bool,

    /// Number of error-fixing iterations after validation.
    #[serde(default)]
    pub max_iterations: u32,

    /// Launch a preview container once generation completes.
    #[serde(default)]
    pub preview: bool,
}

fn default_input_mode() -> InputMode {
    InputMode::Scratch
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enable_planning: false,
            input_mode: InputMode::Scratch,
            enable_validation: false,
            max_iterations: 0,
            preview: false,
        }
    }
}

/// Input/output token counts. Additive only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> u64 {
        self.input.saturating_add(self.output)
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: Self) -> Self::Output {
        TokenUsage {
            input: self.input.saturating_add(rhs.input),
            output: self.output.saturating_add(rhs.output),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Metrics accumulated over a session's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub tool_calls: u32,
    pub steps_completed: u32,
    pub duration_ms: u64,
}

/// Session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub prompt: String,
    pub config: SessionConfig,
    pub status: SessionStatus,
    pub metrics: SessionMetrics,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: SessionId,
        prompt: impl Into<String>,
        config: SessionConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            prompt: prompt.into(),
            config,
            status: SessionStatus::Pending,
            metrics: SessionMetrics::default(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark as generating. Ignored once terminal.
    pub fn mark_generating(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = SessionStatus::Generating;
        self.updated_at = now;
        true
    }

    /// Record the terminal status and final metrics. Ignored once terminal.
    pub fn finish(
        &mut self,
        status: SessionStatus,
        metrics: SessionMetrics,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.metrics = metrics;
        self.error_message = error_message;
        self.updated_at = now;
        true
    }
}

/// Final metrics handed back to the caller, whatever the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub tool_calls: u32,
    pub steps_completed: u32,
    pub duration_ms: u64,
    /// Sanitized error text (never raw paths or stack traces).
    pub error_message: Option<String>,
    /// Set when the persistence sink rejected the final update, so the
    /// persisted record may not match these numbers.
    #[serde(default)]
    pub persistence_warning: bool,
}

impl GenerationMetrics {
    pub fn from_session(session: &Session) -> Self {
        let m = &session.metrics;
        Self {
            session_id: session.id,
            status: session.status,
            input_tokens: m.tokens.input,
            output_tokens: m.tokens.output,
            total_tokens: m.tokens.total(),
            cost_usd: m.cost_usd,
            tool_calls: m.tool_calls,
            steps_completed: m.steps_completed,
            duration_ms: m.duration_ms,
            error_message: session.error_message.clone(),
            persistence_warning: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn session() -> Session {
        Session::new(
            SessionId::from_ulid(Ulid::new()),
            "todo app",
            SessionConfig::default(),
            Utc::now(),
        )
    }

    #[rstest]
    #[case::pending(SessionStatus::Pending, false)]
    #[case::generating(SessionStatus::Generating, false)]
    #[case::completed(SessionStatus::Completed, true)]
    #[case::failed(SessionStatus::Failed, true)]
    #[case::cancelled(SessionStatus::Cancelled, true)]
    fn terminal_statuses(#[case] status: SessionStatus, #[case] terminal: bool) {
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn status_serializes_lowercase() {
        let s = serde_json::to_string(&SessionStatus::Cancelled).unwrap();
        assert_eq!(s, "\"cancelled\"");
    }

    #[test]
    fn token_usage_adds_fieldwise() {
        let mut usage = TokenUsage::new(100, 50);
        usage += TokenUsage::new(10, 5);
        assert_eq!(usage, TokenUsage::new(110, 55));
        assert_eq!(usage.total(), 165);
    }

    #[test]
    fn session_is_immutable_once_terminal() {
        let mut s = session();
        assert!(s.mark_generating(Utc::now()));

        let metrics = SessionMetrics {
            tokens: TokenUsage::new(1, 2),
            ..SessionMetrics::default()
        };
        assert!(s.finish(SessionStatus::Completed, metrics, None, Utc::now()));

        assert!(!s.mark_generating(Utc::now()));
        assert!(!s.finish(
            SessionStatus::Failed,
            SessionMetrics::default(),
            Some("late".to_string()),
            Utc::now()
        ));
        assert_eq!(s.status, SessionStatus::Completed);
        assert_eq!(s.metrics.tokens.total(), 3);
    }

    #[test]
    fn finish_rejects_non_terminal_status() {
        let mut s = session();
        assert!(!s.finish(
            SessionStatus::Generating,
            SessionMetrics::default(),
            None,
            Utc::now()
        ));
        assert_eq!(s.status, SessionStatus::Pending);
    }

    #[test]
    fn metrics_total_is_sum_of_input_and_output() {
        let mut s = session();
        s.finish(
            SessionStatus::Completed,
            SessionMetrics {
                tokens: TokenUsage::new(100, 50),
                cost_usd: 0.002,
                tool_calls: 3,
                steps_completed: 1,
                duration_ms: 10,
            },
            None,
            Utc::now(),
        );

        let m = GenerationMetrics::from_session(&s);
        assert_eq!(m.total_tokens, m.input_tokens + m.output_tokens);
        assert_eq!(m.total_tokens, 150);
        assert_eq!(m.status, SessionStatus::Completed);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = r#"{ "input_mode": { "mode": "template", "name": "vite-react" } }"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.input_mode.template_name(), Some("vite-react"));
        assert!(!config.enable_planning);
        assert_eq!(config.max_iterations, 0);
    }
}
