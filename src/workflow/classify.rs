//! Failure and confusion classification.

use serde::{Deserialize, Serialize};

use crate::intervention::InterventionKind;

/// What an error message says went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    MissingInstructions,
    PermissionDenied,
    MissingFile,
    Other,
}

impl ErrorClass {
    /// Matched in order; the instruction file check comes first so that
    /// "CLAUDE.md not found" is not read as a plain missing file.
    pub fn of(error: &str) -> Self {
        let lower = error.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        if has(&["claude.md", "no instructions", "missing instructions"]) {
            ErrorClass::MissingInstructions
        } else if has(&["permission denied", "eacces", "eperm"]) {
            ErrorClass::PermissionDenied
        } else if has(&["no such file", "not found", "enoent", "missing"]) {
            ErrorClass::MissingFile
        } else {
            ErrorClass::Other
        }
    }

    pub fn is_recoverable(self) -> bool {
        self != ErrorClass::Other
    }

    pub fn suggested_intervention(self) -> InterventionKind {
        match self {
            ErrorClass::MissingInstructions => InterventionKind::MissingInstructions,
            ErrorClass::PermissionDenied => InterventionKind::PermissionRequired,
            ErrorClass::MissingFile => InterventionKind::FileConfusion,
            ErrorClass::Other => InterventionKind::GeneralConfusion,
        }
    }
}

/// How a failure report is escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSeverity {
    /// The step is on the workflow type's critical list.
    Critical,
    /// The error text names something an intervention can supply.
    Recoverable,
    /// Recorded only.
    Minor,
}

impl FailureSeverity {
    pub fn classify(critical_step: bool, class: ErrorClass) -> Self {
        if critical_step {
            FailureSeverity::Critical
        } else if class.is_recoverable() {
            FailureSeverity::Recoverable
        } else {
            FailureSeverity::Minor
        }
    }

    pub fn needs_intervention(self) -> bool {
        self != FailureSeverity::Minor
    }
}

/// What a confused agent appears to be missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfusionCategory {
    MissingRequirements,
    MissingInstructions,
    MissingFiles,
    NeedsClarification,
    Generic,
}

impl ConfusionCategory {
    pub fn of(signal: &str) -> Self {
        let lower = signal.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        if has(&["claude.md", "instructions"]) {
            ConfusionCategory::MissingInstructions
        } else if has(&[
            "requirement",
            "prd",
            "what should i build",
            "what would you like me to build",
            "no context",
            "more context",
        ]) {
            ConfusionCategory::MissingRequirements
        } else if has(&[
            "can't find",
            "cannot find",
            "couldn't find",
            "no such file",
            "file not found",
            "does not exist",
            "doesn't exist",
            "where is",
        ]) {
            ConfusionCategory::MissingFiles
        } else if has(&[
            "clarify",
            "unclear",
            "ambiguous",
            "which one",
            "could you specify",
            "more information",
            "more details",
            "do you want",
        ]) {
            ConfusionCategory::NeedsClarification
        } else {
            ConfusionCategory::Generic
        }
    }

    pub fn suggested_intervention(self) -> InterventionKind {
        match self {
            ConfusionCategory::MissingRequirements => InterventionKind::RequirementsMissing,
            ConfusionCategory::MissingInstructions => InterventionKind::MissingInstructions,
            ConfusionCategory::MissingFiles => InterventionKind::FileConfusion,
            ConfusionCategory::NeedsClarification => InterventionKind::ClarificationNeeded,
            ConfusionCategory::Generic => InterventionKind::GeneralConfusion,
        }
    }
}
