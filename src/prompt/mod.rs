//! Signal detection for agent output.
//!
//! The supervisor scans each ANSI-stripped output line for three kinds of
//! signal: the agent saying it is confused or lacks context, an error, or a
//! permission prompt. Patterns are tried in order and the first match wins,
//! so permission prompts (which often mention files) are checked before
//! confusion and errors.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// What kind of signal was detected in a line of agent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// The agent is asking for approval to run a tool or touch files.
    Permission,
    /// The agent says it lacks requirements, files or direction.
    Confusion,
    /// A command or tool reported an error.
    Error,
}

/// A detected signal with the full line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub kind: SignalKind,
    pub matched_text: String,
    pub line: String,
}

/// Compiled signal patterns.
pub struct SignalPatterns {
    patterns: Vec<(Regex, SignalKind)>,
}

impl SignalPatterns {
    /// Scan one ANSI-stripped line. Returns the first match found.
    pub fn detect(&self, line: &str) -> Option<Signal> {
        for (regex, kind) in &self.patterns {
            if let Some(m) = regex.find(line) {
                return Some(Signal {
                    kind: *kind,
                    matched_text: m.as_str().to_string(),
                    line: line.trim().to_string(),
                });
            }
        }
        None
    }

    /// Patterns for interactive coding agents after ANSI stripping.
    pub fn agent_output() -> Self {
        let table: &[(&str, SignalKind)] = &[
            // Tool approval
            (r"(?i)\ballow\s+tool\b", SignalKind::Permission),
            (
                r"(?i)do you want to (?:proceed|make this edit|create|allow)",
                SignalKind::Permission,
            ),
            (r"(?i)\bpermission (?:to|required|needed)\b", SignalKind::Permission),
            // Missing context
            (
                r"(?i)(?:no|missing|can't find|cannot find|couldn't find|don't see)\s+(?:any\s+)?(?:CLAUDE\.md|requirements|instructions|PRD)",
                SignalKind::Confusion,
            ),
            (
                r"(?i)(?:i'm|i am)\s+(?:not sure|unsure|confused)",
                SignalKind::Confusion,
            ),
            (
                r"(?i)(?:what (?:should|would you like me to) (?:i )?build|could you (?:clarify|provide more)|need more (?:context|information|details))",
                SignalKind::Confusion,
            ),
            (
                r"(?i)(?:unclear|ambiguous)\s+(?:what|which|requirements?|instructions?)",
                SignalKind::Confusion,
            ),
            // Errors
            (
                r"(?i)\b(?:ENOENT|EACCES|no such file or directory|permission denied)\b",
                SignalKind::Error,
            ),
            (r"(?i)^\s*(?:error|fatal)(?:\[\w+\])?:", SignalKind::Error),
            (r"(?i)\bcommand not found\b", SignalKind::Error),
            (r#""is_error"\s*:\s*true"#, SignalKind::Error),
        ];
        Self {
            patterns: table
                .iter()
                .filter_map(|(re, kind)| Regex::new(re).ok().map(|re| (re, *kind)))
                .collect(),
        }
    }
}

impl Default for SignalPatterns {
    fn default() -> Self {
        Self::agent_output()
    }
}

/// Strip ANSI escape sequences from PTY output.
pub fn strip_ansi(input: &str) -> String {
    // Matches CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... ST),
    // and simple two-byte escapes (ESC + one char).
    static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]")
            .expect("valid ANSI regex")
    });
    ANSI_RE.replace_all(input, "").to_string()
}

/// Splits streamed output into complete lines. Both `\n` and bare `\r` end a
/// line; the trailing partial line is kept until more output arrives.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: String,
}

impl LineAssembler {
    /// Feed a chunk and return the complete, ANSI-stripped, non-blank lines.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find(['\n', '\r']) {
            let line: String = self.partial.drain(..=pos).collect();
            let stripped = strip_ansi(line.trim_end_matches(['\n', '\r']));
            if !stripped.trim().is_empty() {
                lines.push(stripped);
            }
        }
        lines
    }

    pub fn pending(&self) -> &str {
        &self.partial
    }
}
