//! Per-session log buffers with batch pruning and build-event detection.

use std::collections::{HashMap, VecDeque};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

use crate::config::LogConfig;
use crate::domain::events::BuildEvent;
use crate::domain::ids::SessionId;
use crate::ports::LogLine;

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("static regex"));

static READY_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bready in\b|\bLocal:\s").expect("static regex"));

static ERROR_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\berror\b|\bfailed\b").expect("static regex"));

/// Bounded buffer for one session.
#[derive(Debug, Default)]
pub struct LogBuffer {
    entries: VecDeque<LogLine>,
}

impl LogBuffer {
    /// Append, then trim to `max_entries` in one batch once the buffer grows
    /// past `prune_threshold`.
    fn push(&mut self, line: LogLine, config: &LogConfig) {
        self.entries.push_back(line);
        if self.entries.len() > config.prune_threshold {
            let excess = self.entries.len().saturating_sub(config.max_entries);
            self.entries.drain(..excess);
        }
    }

    fn recent(&self, n: usize) -> Vec<LogLine> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

#[derive(Debug)]
pub struct LogManager {
    config: LogConfig,
    buffers: Mutex<HashMap<SessionId, LogBuffer>>,
}

impl LogManager {
    pub fn new(config: LogConfig) -> Self {
        Self {
            config,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Store a line and report any build-lifecycle marker it carries.
    pub fn append(&self, session_id: SessionId, line: LogLine) -> Option<BuildEvent> {
        let event = detect_build_event(&line.line);
        self.buffers
            .lock()
            .entry(session_id)
            .or_default()
            .push(line, &self.config);
        event
    }

    /// Up to `n` most recent lines, oldest first.
    pub fn recent(&self, session_id: SessionId, n: usize) -> Vec<LogLine> {
        self.buffers
            .lock()
            .get(&session_id)
            .map(|b| b.recent(n))
            .unwrap_or_default()
    }

    pub fn len(&self, session_id: SessionId) -> usize {
        self.buffers
            .lock()
            .get(&session_id)
            .map_or(0, |b| b.entries.len())
    }

    pub fn remove(&self, session_id: SessionId) {
        self.buffers.lock().remove(&session_id);
    }

    pub fn sessions(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// Ready markers win over error markers on the same line.
pub fn detect_build_event(raw: &str) -> Option<BuildEvent> {
    let line = ANSI_ESCAPE.replace_all(raw, "");
    if READY_MARKER.is_match(&line) {
        Some(BuildEvent::Ready)
    } else if ERROR_MARKER.is_match(&line) {
        Some(BuildEvent::Error {
            message: line.trim().to_string(),
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn manager() -> LogManager {
        LogManager::new(LogConfig::default())
    }

    #[rstest]
    #[case::vite_ready("  VITE v5.0.0  ready in 412 ms", Some(BuildEvent::Ready))]
    #[case::local_url("  ➜  Local:   http://localhost:5173/", Some(BuildEvent::Ready))]
    #[case::colored("\x1b[32m  VITE\x1b[39m ready in \x1b[1m300\x1b[22m ms", Some(BuildEvent::Ready))]
    #[case::plain("transforming...", None)]
    fn detects_markers(#[case] line: &str, #[case] expected: Option<BuildEvent>) {
        assert_eq!(detect_build_event(line), expected);
    }

    #[test]
    fn detects_errors() {
        let event = detect_build_event("[vite] Internal server error: Failed to resolve import");
        assert!(matches!(event, Some(BuildEvent::Error { message }) if message.contains("Failed to resolve")));
        assert!(matches!(detect_build_event("Build failed"), Some(BuildEvent::Error { .. })));
    }

    #[test]
    fn prunes_in_one_batch() {
        let m = manager();
        let id = SessionId::from_ulid(Ulid::new());

        for i in 0..1200 {
            m.append(id, LogLine::stdout(format!("line {i}")));
        }
        assert_eq!(m.len(id), 1200);

        m.append(id, LogLine::stdout("line 1200"));
        assert_eq!(m.len(id), 1000);

        let recent = m.recent(id, 2);
        assert_eq!(recent[0].line, "line 1199");
        assert_eq!(recent[1].line, "line 1200");
        assert_eq!(m.recent(id, 5000)[0].line, "line 201");
    }

    #[test]
    fn threshold_below_capacity_keeps_appending() {
        let m = LogManager::new(LogConfig {
            max_entries: 10,
            prune_threshold: 3,
        });
        let id = SessionId::from_ulid(Ulid::new());

        for i in 0..5 {
            m.append(id, LogLine::stdout(format!("line {i}")));
        }
        assert_eq!(m.len(id), 5);
        assert_eq!(m.recent(id, 1)[0].line, "line 4");
    }

    #[test]
    fn buffers_are_per_session() {
        let m = manager();
        let a = SessionId::from_ulid(Ulid::new());
        let b = SessionId::from_ulid(Ulid::new());

        m.append(a, LogLine::stdout("a"));
        m.append(b, LogLine::stderr("b"));
        m.remove(a);

        assert_eq!(m.len(a), 0);
        assert_eq!(m.recent(b, 10), vec![LogLine::stderr("b")]);
        assert_eq!(m.sessions(), 1);
    }
}
