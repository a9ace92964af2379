//! Intervention kinds and the strategy table that answers each one.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::context::Scenario;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    RequirementsMissing,
    MissingInstructions,
    FileConfusion,
    ClarificationNeeded,
    PermissionRequired,
    WorkflowStuck,
    GeneralConfusion,
}

impl InterventionKind {
    pub const ALL: [InterventionKind; 7] = [
        InterventionKind::RequirementsMissing,
        InterventionKind::MissingInstructions,
        InterventionKind::FileConfusion,
        InterventionKind::ClarificationNeeded,
        InterventionKind::PermissionRequired,
        InterventionKind::WorkflowStuck,
        InterventionKind::GeneralConfusion,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InterventionKind::RequirementsMissing => "requirements_missing",
            InterventionKind::MissingInstructions => "missing_instructions",
            InterventionKind::FileConfusion => "file_confusion",
            InterventionKind::ClarificationNeeded => "clarification_needed",
            InterventionKind::PermissionRequired => "permission_required",
            InterventionKind::WorkflowStuck => "workflow_stuck",
            InterventionKind::GeneralConfusion => "general_confusion",
        }
    }

    /// Parse a kind name; unknown names map to general confusion.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(InterventionKind::GeneralConfusion)
    }
}

impl fmt::Display for InterventionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterventionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InterventionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown intervention type: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// How a response reaches the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Text injected into the session.
    Text,
    /// Write the sidecar instruction file, then point the agent at it.
    InstructionFile,
    /// Ask a human to approve; nothing is injected until they answer.
    PermissionRequest,
}

pub struct Strategy {
    pub kind: InterventionKind,
    pub priority: Priority,
    pub delivery: Delivery,
    pub scenario: Scenario,
    /// Placeholders: `{context}`, `{step}`, `{signal}`, `{file}`. Injected
    /// templates leave out `{signal}`; it would be read back as new output.
    pub template: &'static str,
}

const STRATEGIES: &[Strategy] = &[
    Strategy {
        kind: InterventionKind::RequirementsMissing,
        priority: Priority::High,
        delivery: Delivery::Text,
        scenario: Scenario::RequirementsMissing,
        template: "Here are the project requirements you asked about:\n\n{context}\n\nPlease continue with the implementation based on these requirements.",
    },
    Strategy {
        kind: InterventionKind::MissingInstructions,
        priority: Priority::Critical,
        delivery: Delivery::InstructionFile,
        scenario: Scenario::InstructionsMissing,
        template: "I've written {file} at the project root with the project instructions. Please read {file} and continue.\n\n{context}",
    },
    Strategy {
        kind: InterventionKind::FileConfusion,
        priority: Priority::Medium,
        delivery: Delivery::Text,
        scenario: Scenario::FileConfusion,
        template: "Here is the current project layout:\n\n{context}\n\nUse these paths to locate the files you need.",
    },
    Strategy {
        kind: InterventionKind::ClarificationNeeded,
        priority: Priority::Medium,
        delivery: Delivery::Text,
        scenario: Scenario::ClarificationNeeded,
        template: "This is what the project documents say:\n\n{context}\n\nChoose the option most consistent with these requirements and continue.",
    },
    Strategy {
        kind: InterventionKind::PermissionRequired,
        priority: Priority::High,
        delivery: Delivery::PermissionRequest,
        scenario: Scenario::General,
        template: "Approval requested: {signal}",
    },
    Strategy {
        kind: InterventionKind::WorkflowStuck,
        priority: Priority::High,
        delivery: Delivery::Text,
        scenario: Scenario::WorkflowStuck,
        template: "It looks like progress on '{step}' has stalled. Here is the project context to help you continue:\n\n{context}",
    },
    Strategy {
        kind: InterventionKind::GeneralConfusion,
        priority: Priority::Low,
        delivery: Delivery::Text,
        scenario: Scenario::General,
        template: "Here is the full project context:\n\n{context}\n\nPlease continue with the task.",
    },
];

/// Strategy for `kind`. Every kind has exactly one entry; general confusion
/// is the catch-all.
pub fn strategy_for(kind: InterventionKind) -> &'static Strategy {
    STRATEGIES
        .iter()
        .find(|s| s.kind == kind)
        .unwrap_or(&STRATEGIES[STRATEGIES.len() - 1])
}

/// Substitute `{name}` placeholders. Unknown placeholders are left as is.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in values {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}
