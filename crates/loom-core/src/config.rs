//! Engine configuration.
//!
//! Every field has a default, so an empty TOML file is a valid config.
//! `EngineConfig::load` reads and validates in one step.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::errors::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workspace: WorkspaceConfig,
    pub container: ContainerConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub logs: LogConfig,
    pub health: HealthConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Every session directory lives directly under this path.
    pub base_dir: PathBuf,
    pub templates_dir: PathBuf,
    /// Template names that may be seeded. Anything else is rejected.
    pub allowed_templates: Vec<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("loom").join("workspaces"),
            templates_dir: PathBuf::from("templates"),
            allowed_templates: vec!["vite-react".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub image: String,
    pub memory_limit_mb: u64,
    pub cpus: f64,
    pub client_container_port: u16,
    pub server_container_port: u16,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub install_timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub max_runtime_secs: u64,
    pub creation_timeout_secs: u64,
    pub vite_ready_timeout_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "node:20-alpine".to_string(),
            memory_limit_mb: 512,
            cpus: 0.5,
            client_container_port: 5173,
            server_container_port: 3001,
            port_range_start: 5001,
            port_range_end: 5200,
            install_timeout_secs: 300,
            start_timeout_secs: 30,
            stop_grace_secs: 10,
            max_runtime_secs: 600,
            creation_timeout_secs: 120,
            vite_ready_timeout_secs: 30,
        }
    }
}

impl ContainerConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    pub fn creation_timeout(&self) -> Duration {
        Duration::from_secs(self.creation_timeout_secs)
    }

    pub fn vite_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.vite_ready_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (2 means 3 attempts in total).
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 1000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Entries kept after a prune.
    pub max_entries: usize,
    /// Buffer size that triggers a prune.
    pub prune_threshold: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            prune_threshold: 1200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub max_attempts: u32,
    pub request_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_attempts: 60,
            request_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub timeout_minutes: u64,
    /// Tool-call budget for each refinement iteration.
    pub refinement_tool_budget: u32,
    /// Finished sessions kept for status queries. Older ones are forgotten.
    pub retained_sessions: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 15,
            refinement_tool_budget: 10,
            retained_sessions: 1000,
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.container;
        if c.port_range_end <= c.port_range_start {
            return Err(invalid(
                "container.port_range",
                format!(
                    "need at least two ports, got {}-{}",
                    c.port_range_start, c.port_range_end
                ),
            ));
        }
        if c.memory_limit_mb == 0 {
            return Err(invalid("container.memory_limit_mb", "must be > 0"));
        }
        if !(c.cpus.is_finite() && c.cpus > 0.0) {
            return Err(invalid("container.cpus", "must be a positive number"));
        }

        let timeouts = [
            ("container.install_timeout_secs", c.install_timeout_secs),
            ("container.start_timeout_secs", c.start_timeout_secs),
            ("container.max_runtime_secs", c.max_runtime_secs),
            ("container.creation_timeout_secs", c.creation_timeout_secs),
            ("container.vite_ready_timeout_secs", c.vite_ready_timeout_secs),
            ("health.interval_ms", self.health.interval_ms),
            ("health.request_timeout_ms", self.health.request_timeout_ms),
            ("generation.timeout_minutes", self.generation.timeout_minutes),
            ("circuit_breaker.reset_timeout_secs", self.circuit_breaker.reset_timeout_secs),
        ];
        if let Some((field, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(invalid(*field, "must be > 0"));
        }

        if self.health.max_attempts == 0 {
            return Err(invalid("health.max_attempts", "must be > 0"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be > 0"));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(invalid("retry.multiplier", "must be >= 1.0"));
        }
        if self.generation.retained_sessions == 0 {
            return Err(invalid("generation.retained_sessions", "must be > 0"));
        }
        if self.logs.max_entries == 0 {
            return Err(invalid("logs.max_entries", "must be > 0"));
        }
        if self.logs.prune_threshold <= self.logs.max_entries {
            return Err(invalid(
                "logs.prune_threshold",
                format!("must exceed max_entries ({})", self.logs.max_entries),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.container.port_range_start, 5001);
        assert_eq!(config.container.port_range_end, 5200);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.logs.prune_threshold, 1200);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [container]
            image = "node:22"
            vite_ready_timeout_secs = 45

            [generation]
            timeout_minutes = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.container.image, "node:22");
        assert_eq!(config.container.vite_ready_timeout(), Duration::from_secs(45));
        assert_eq!(config.container.memory_limit_mb, 512);
        assert_eq!(config.generation.timeout(), Duration::from_secs(300));
    }

    #[rstest]
    #[case::single_port("[container]\nport_range_start = 5001\nport_range_end = 5001", "container.port_range")]
    #[case::inverted("[container]\nport_range_start = 6000\nport_range_end = 5000", "container.port_range")]
    #[case::prune("[logs]\nmax_entries = 100\nprune_threshold = 100", "logs.prune_threshold")]
    #[case::attempts("[health]\nmax_attempts = 0", "health.max_attempts")]
    #[case::timeout("[container]\nvite_ready_timeout_secs = 0", "container.vite_ready_timeout_secs")]
    #[case::retention("[generation]\nretained_sessions = 0", "generation.retained_sessions")]
    fn rejects_invalid_values(#[case] toml: &str, #[case] expected_field: &str) {
        match EngineConfig::from_toml_str(toml) {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected_field),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn syntax_errors_are_parse_errors() {
        assert!(matches!(
            EngineConfig::from_toml_str("[container"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = EngineConfig::load("/definitely/not/here/loom.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
