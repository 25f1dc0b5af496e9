//! Terminal output → session state inference.
//!
//! Maintains a rolling buffer of recent pane lines and classifies the
//! session as idle, working, errored, or unknown, with hysteresis so a
//! single flickering line doesn't flip the reported state.

use std::collections::VecDeque;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;

/// Recent lines kept for pattern analysis.
const BUFFER_LINES: usize = 50;
/// Only the tail of the buffer is actually inspected per analysis pass.
const ANALYSIS_WINDOW: usize = 10;
/// A detected state must hold for this long before it's reported.
const STATE_CHANGE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SessionState {
    Unknown,
    Idle,
    Working,
    Error,
    /// Overlaid on top of `Working` by the idle monitor once a session has
    /// been working continuously past the stall threshold.
    Stalled,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Unknown => "unknown",
            SessionState::Idle => "idle",
            SessionState::Working => "working",
            SessionState::Error => "error",
            SessionState::Stalled => "stalled",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DetectionResult {
    pub state: SessionState,
    pub confidence: f64,
    pub reason: &'static str,
}

const SPINNER_CHARS: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

static WORKING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)Thinking|Channelling").unwrap(),
        Regex::new(r"⠋|⠙|⠹|⠸|⠼|⠴|⠦|⠧|⠇|⠏").unwrap(),
        Regex::new(r"Running…|Executing").unwrap(),
        Regex::new(r"thought for \d+s").unwrap(),
        Regex::new(r"(?i)esc to interrupt").unwrap(),
    ]
});

static IDLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"❯").unwrap(),
        Regex::new(r"Do you want to proceed\?").unwrap(),
        Regex::new(r"Esc to cancel").unwrap(),
        Regex::new(r"\? for shortcuts").unwrap(),
        Regex::new(r"(?s)Yes.*No").unwrap(),
    ]
});

static ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)rate limit|rate_limit").unwrap(),
        Regex::new(r"(?i)429|too many requests").unwrap(),
        Regex::new(r"(?i)overloaded").unwrap(),
        Regex::new(r"(?i)APIError|API error|APIConnectionError").unwrap(),
        Regex::new(r"(?i)unexpected error|Connection error").unwrap(),
    ]
});

static SHELL_PROMPT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"[$%#]\s*$").unwrap(),
        Regex::new(r"@.*[$%#]\s*$").unwrap(),
        Regex::new(r"^\s*\w+@[\w.-]+[:\s]").unwrap(),
    ]
});

static ANSI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]|\x1b\][^\x07]*\x07|\x1b[PX^_][^\x1b]*\x1b\\").unwrap()
});

fn strip_ansi(line: &str) -> String {
    ANSI_PATTERN.replace_all(line, "").into_owned()
}

pub(crate) struct IdleDetector {
    buffer: VecDeque<String>,
    current_state: SessionState,
    pending_state: Option<SessionState>,
    pending_since: Option<Instant>,
}

impl Default for IdleDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleDetector {
    pub fn new() -> Self {
        Self {
            buffer: VecDeque::with_capacity(BUFFER_LINES),
            current_state: SessionState::Unknown,
            pending_state: None,
            pending_since: None,
        }
    }

    fn push_lines(&mut self, data: &str) {
        for line in data.split('\n') {
            let clean = strip_ansi(line);
            if clean.is_empty() {
                continue;
            }
            if self.buffer.len() == BUFFER_LINES {
                self.buffer.pop_front();
            }
            self.buffer.push_back(clean);
        }
    }

    /// Feed incremental output and apply hysteresis before reporting a
    /// state transition.
    pub fn process_output(&mut self, data: &str) -> DetectionResult {
        self.push_lines(data);
        let (detected, confidence, reason) = self.analyze();
        let now = Instant::now();

        if detected != self.current_state {
            match self.pending_state {
                Some(pending) if pending == detected => {
                    let since = self.pending_since.unwrap_or(now);
                    if now.duration_since(since) >= STATE_CHANGE_DELAY {
                        self.current_state = detected;
                        self.pending_state = None;
                        self.pending_since = None;
                    }
                }
                _ => {
                    self.pending_state = Some(detected);
                    self.pending_since = Some(now);
                }
            }
        } else {
            self.pending_state = None;
            self.pending_since = None;
        }

        DetectionResult {
            state: self.current_state,
            confidence,
            reason,
        }
    }

    /// Analyze a full pane snapshot and set the state immediately, with no
    /// hysteresis. Used for the initial snapshot sent on attach and by the
    /// background idle monitor, which only ever sees point-in-time snapshots.
    pub fn analyze_initial_content(&mut self, content: &str) -> DetectionResult {
        self.push_lines(content);
        let (detected, confidence, reason) = self.analyze();
        self.current_state = detected;
        self.pending_state = None;
        self.pending_since = None;
        DetectionResult {
            state: detected,
            confidence,
            reason,
        }
    }

    pub fn state(&self) -> SessionState {
        self.current_state
    }

    fn analyze(&self) -> (SessionState, f64, &'static str) {
        if self.buffer.is_empty() {
            return (SessionState::Unknown, 0.0, "no data");
        }

        let start = self.buffer.len().saturating_sub(ANALYSIS_WINDOW);
        let recent: Vec<&str> = self.buffer.iter().skip(start).map(|s| s.as_str()).collect();
        let last_line = *recent.last().unwrap_or(&"");

        for line in &recent {
            if ERROR_PATTERNS.iter().any(|p| p.is_match(line)) {
                return (SessionState::Error, 0.9, "error pattern");
            }
        }

        let mut has_working_or_idle = false;
        'outer: for line in &recent {
            if line.chars().any(|c| SPINNER_CHARS.contains(&c)) {
                has_working_or_idle = true;
                break 'outer;
            }
            if WORKING_PATTERNS.iter().any(|p| p.is_match(line)) {
                has_working_or_idle = true;
                break 'outer;
            }
            if IDLE_PATTERNS.iter().any(|p| p.is_match(line)) {
                has_working_or_idle = true;
                break 'outer;
            }
        }

        if !has_working_or_idle && SHELL_PROMPT_PATTERNS.iter().any(|p| p.is_match(last_line)) {
            return (SessionState::Error, 0.85, "shell prompt");
        }

        if last_line.chars().any(|c| SPINNER_CHARS.contains(&c)) {
            return (SessionState::Working, 0.95, "spinner detected");
        }

        for line in &recent {
            if WORKING_PATTERNS.iter().any(|p| p.is_match(line)) {
                return (SessionState::Working, 0.85, "working pattern");
            }
        }

        for line in &recent {
            if IDLE_PATTERNS.iter().any(|p| p.is_match(line)) {
                return (SessionState::Idle, 0.9, "idle pattern");
            }
        }

        (SessionState::Unknown, 0.3, "unable to determine")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn spinner_marks_working_immediately_on_initial_snapshot() {
        let mut d = IdleDetector::new();
        let r = d.analyze_initial_content("Thinking ⠋ about your request");
        assert_eq!(r.state, SessionState::Working);
    }

    #[test]
    fn idle_prompt_marks_idle_on_initial_snapshot() {
        let mut d = IdleDetector::new();
        let r = d.analyze_initial_content("❯ ");
        assert_eq!(r.state, SessionState::Idle);
    }

    #[test]
    fn shell_prompt_with_no_other_signal_is_error() {
        let mut d = IdleDetector::new();
        let r = d.analyze_initial_content("user@host:~/project$ ");
        assert_eq!(r.state, SessionState::Error);
    }

    #[test]
    fn hysteresis_delays_state_change_until_stable() {
        let mut d = IdleDetector::new();
        d.analyze_initial_content("❯ ");
        assert_eq!(d.state(), SessionState::Idle);

        // A single working-looking line doesn't flip the reported state yet.
        let r1 = d.process_output("Thinking ⠋");
        assert_eq!(r1.state, SessionState::Idle);

        sleep(Duration::from_millis(520));
        let r2 = d.process_output("Thinking ⠋");
        assert_eq!(r2.state, SessionState::Working);
    }

    #[test]
    fn rate_limit_takes_priority_over_working_patterns() {
        let mut d = IdleDetector::new();
        let r = d.analyze_initial_content("Thinking ⠋\nError: rate limit exceeded");
        assert_eq!(r.state, SessionState::Error);
    }
}
