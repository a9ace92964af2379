//! Workflow type definitions: ordered steps, critical steps, per-step
//! timeouts and the output patterns that mark a step complete.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    ClaudeCodeLaunch,
    ProjectSetup,
    PrdGeneration,
}

pub struct StepDef {
    pub name: &'static str,
    pub critical: bool,
    pub timeout: Option<Duration>,
    /// Output that proves the step happened. Steps without a pattern are
    /// completed through the API only.
    pub pattern: Option<&'static str>,
}

const fn secs(n: u64) -> Option<Duration> {
    Some(Duration::from_secs(n))
}

const CLAUDE_CODE_LAUNCH: &[StepDef] = &[
    StepDef {
        name: "requirements_gathered",
        critical: false,
        timeout: secs(300),
        pattern: None,
    },
    StepDef {
        name: "instructions_written",
        critical: true,
        timeout: secs(30),
        pattern: Some(r"(?i)(?:wrote|created|updated|writing)\s+(?:to\s+)?CLAUDE\.md"),
    },
    StepDef {
        name: "agent_launched",
        critical: true,
        timeout: secs(30),
        pattern: Some(r"(?i)welcome to claude|claude code v?\d"),
    },
    StepDef {
        name: "implementation_started",
        critical: false,
        timeout: secs(120),
        pattern: Some(r"(?i)(?:creating|writing|editing|updating)\s+(?:file\s+)?\S+\.\w{1,6}\b"),
    },
];

const PROJECT_SETUP: &[StepDef] = &[
    StepDef {
        name: "directory_created",
        critical: false,
        timeout: secs(10),
        pattern: Some(r"(?i)\bmkdir\b|created (?:project )?directory"),
    },
    StepDef {
        name: "dependencies_installed",
        critical: true,
        timeout: secs(180),
        pattern: Some(
            r"(?i)added \d+ packages?|successfully installed|dependencies installed|Finished .*target",
        ),
    },
    StepDef {
        name: "dev_server_started",
        critical: false,
        timeout: None,
        pattern: Some(
            r"(?i)(?:localhost|127\.0\.0\.1):\d{2,5}|server (?:is )?(?:running|started|listening)",
        ),
    },
];

const PRD_GENERATION: &[StepDef] = &[
    StepDef {
        name: "questions_answered",
        critical: false,
        timeout: secs(600),
        pattern: None,
    },
    StepDef {
        name: "prd_generated",
        critical: true,
        timeout: None,
        pattern: Some(r"(?i)(?:wrote|created|generated)\s+(?:the\s+)?(?:PRD\.md|product requirements)"),
    },
    StepDef {
        name: "prd_reviewed",
        critical: false,
        timeout: secs(300),
        pattern: None,
    },
];

/// Compiled step patterns, indexed like the step tables.
static STEP_PATTERNS: LazyLock<Vec<(WorkflowKind, &'static str, Regex)>> = LazyLock::new(|| {
    WorkflowKind::ALL
        .iter()
        .flat_map(|kind| {
            kind.steps().iter().filter_map(move |step| {
                step.pattern
                    .and_then(|p| Regex::new(p).ok())
                    .map(|re| (*kind, step.name, re))
            })
        })
        .collect()
});

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 3] = [
        WorkflowKind::ClaudeCodeLaunch,
        WorkflowKind::ProjectSetup,
        WorkflowKind::PrdGeneration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowKind::ClaudeCodeLaunch => "claude_code_launch",
            WorkflowKind::ProjectSetup => "project_setup",
            WorkflowKind::PrdGeneration => "prd_generation",
        }
    }

    pub fn steps(self) -> &'static [StepDef] {
        match self {
            WorkflowKind::ClaudeCodeLaunch => CLAUDE_CODE_LAUNCH,
            WorkflowKind::ProjectSetup => PROJECT_SETUP,
            WorkflowKind::PrdGeneration => PRD_GENERATION,
        }
    }

    pub fn step_names(self) -> Vec<&'static str> {
        self.steps().iter().map(|s| s.name).collect()
    }

    pub fn has_step(self, step: &str) -> bool {
        self.steps().iter().any(|s| s.name == step)
    }

    pub fn is_critical(self, step: &str) -> bool {
        self.steps().iter().any(|s| s.name == step && s.critical)
    }

    /// Explicit timeout for `step`, if the type declares one.
    pub fn step_timeout(self, step: &str) -> Option<Duration> {
        self.steps()
            .iter()
            .find(|s| s.name == step)
            .and_then(|s| s.timeout)
    }

    /// Steps of this type whose completion pattern matches `line`.
    pub fn steps_matching(self, line: &str) -> Vec<&'static str> {
        STEP_PATTERNS
            .iter()
            .filter(|(kind, _, re)| *kind == self && re.is_match(line))
            .map(|(_, step, _)| *step)
            .collect()
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown workflow type: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_order_is_fixed() {
        assert_eq!(
            WorkflowKind::ClaudeCodeLaunch.step_names(),
            vec![
                "requirements_gathered",
                "instructions_written",
                "agent_launched",
                "implementation_started"
            ]
        );
        assert_eq!(
            WorkflowKind::ProjectSetup.step_names(),
            vec!["directory_created", "dependencies_installed", "dev_server_started"]
        );
    }

    #[test]
    fn critical_steps() {
        assert!(WorkflowKind::ClaudeCodeLaunch.is_critical("agent_launched"));
        assert!(!WorkflowKind::ClaudeCodeLaunch.is_critical("requirements_gathered"));
        assert!(!WorkflowKind::ClaudeCodeLaunch.is_critical("no_such_step"));
        assert!(WorkflowKind::PrdGeneration.is_critical("prd_generated"));
    }

    #[test]
    fn timeouts_fall_back_to_none() {
        assert_eq!(
            WorkflowKind::ClaudeCodeLaunch.step_timeout("agent_launched"),
            Some(Duration::from_secs(30))
        );
        assert_eq!(WorkflowKind::ProjectSetup.step_timeout("dev_server_started"), None);
        assert_eq!(WorkflowKind::ProjectSetup.step_timeout("nope"), None);
    }

    #[test]
    fn output_patterns_mark_steps() {
        assert_eq!(
            WorkflowKind::ClaudeCodeLaunch.steps_matching("✻ Welcome to Claude Code!"),
            vec!["agent_launched"]
        );
        assert_eq!(
            WorkflowKind::ProjectSetup.steps_matching("added 312 packages in 9s"),
            vec!["dependencies_installed"]
        );
        assert_eq!(
            WorkflowKind::ProjectSetup.steps_matching("  ➜  Local:   http://localhost:5173/"),
            vec!["dev_server_started"]
        );
        assert!(WorkflowKind::PrdGeneration.steps_matching("hello").is_empty());
    }

    #[test]
    fn parse_round_trips_names() {
        for kind in WorkflowKind::ALL {
            assert_eq!(kind.as_str().parse::<WorkflowKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<WorkflowKind>().is_err());
        assert_eq!(
            serde_json::to_string(&WorkflowKind::PrdGeneration).unwrap(),
            r#""prd_generation""#
        );
    }
}
