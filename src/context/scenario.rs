//! Scenario-specific context rendering.
//!
//! Each scenario names the snapshot fields that matter for it, in priority
//! order, and the shape the text takes. Unknown scenarios fall back to the
//! comprehensive shape.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ProjectSnapshot;

/// Shown when an agent asks for requirements and the project has none.
pub const FALLBACK_GUIDANCE: &str = "\
No requirements document or CLAUDE.md was found for this project.
Ask the user to describe what they want to build (main features, target users, constraints),
or create PRD.md or CLAUDE.md at the project root and continue from there.";

/// Longest instruction-file excerpt embedded in rendered context.
const INSTRUCTION_EXCERPT: usize = 2000;

const SUMMARY_REQUIREMENTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    RequirementsMissing,
    InstructionsMissing,
    FileConfusion,
    ClarificationNeeded,
    WorkflowStuck,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextField {
    Requirements,
    InstructionFile,
    RequirementDocs,
    ProjectType,
    Dependencies,
    FileTree,
    KeyFiles,
    EntryPoints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextShape {
    StructuredSummary,
    DetailedRequirements,
    TreeListing,
    Comprehensive,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Scenario::RequirementsMissing,
        Scenario::InstructionsMissing,
        Scenario::FileConfusion,
        Scenario::ClarificationNeeded,
        Scenario::WorkflowStuck,
        Scenario::General,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scenario::RequirementsMissing => "requirements_missing",
            Scenario::InstructionsMissing => "instructions_missing",
            Scenario::FileConfusion => "file_confusion",
            Scenario::ClarificationNeeded => "clarification_needed",
            Scenario::WorkflowStuck => "workflow_stuck",
            Scenario::General => "general",
        }
    }

    /// Parse a scenario name, treating anything unrecognized as `General`.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(Scenario::General)
    }

    pub fn fields(self) -> &'static [ContextField] {
        use ContextField::*;
        match self {
            Scenario::RequirementsMissing => &[Requirements, InstructionFile, RequirementDocs],
            Scenario::InstructionsMissing => &[Requirements, ProjectType, Dependencies, KeyFiles],
            Scenario::FileConfusion => &[FileTree, KeyFiles, EntryPoints],
            Scenario::ClarificationNeeded => &[Requirements, ProjectType, InstructionFile],
            Scenario::WorkflowStuck => &[ProjectType, Requirements, KeyFiles, EntryPoints],
            Scenario::General => &[
                ProjectType,
                Requirements,
                InstructionFile,
                RequirementDocs,
                Dependencies,
                KeyFiles,
                EntryPoints,
                FileTree,
            ],
        }
    }

    pub fn shape(self) -> ContextShape {
        match self {
            Scenario::RequirementsMissing => ContextShape::DetailedRequirements,
            Scenario::FileConfusion => ContextShape::TreeListing,
            Scenario::InstructionsMissing
            | Scenario::ClarificationNeeded
            | Scenario::WorkflowStuck => ContextShape::StructuredSummary,
            Scenario::General => ContextShape::Comprehensive,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "claude_md_missing" | "missing_instructions" => Ok(Scenario::InstructionsMissing),
            "missing_requirements" => Ok(Scenario::RequirementsMissing),
            other => Scenario::ALL
                .into_iter()
                .find(|sc| sc.as_str() == other)
                .ok_or_else(|| format!("unknown scenario: {s}")),
        }
    }
}

/// Rendered context for one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioContext {
    pub scenario: Scenario,
    pub shape: ContextShape,
    pub fields: Vec<ContextField>,
    pub text: String,
    /// True when none of the scenario's fields had anything to say.
    pub empty: bool,
}

fn has_field(snap: &ProjectSnapshot, field: ContextField) -> bool {
    match field {
        ContextField::Requirements => !snap.requirements.is_empty(),
        ContextField::InstructionFile => snap.instruction_file.is_some(),
        ContextField::RequirementDocs => !snap.requirement_docs.is_empty(),
        ContextField::ProjectType => snap.category != "unknown" || snap.framework.is_some(),
        ContextField::Dependencies => !snap.dependencies.is_empty(),
        ContextField::FileTree => !snap.file_tree.is_empty(),
        ContextField::KeyFiles => !snap.key_files.is_empty(),
        ContextField::EntryPoints => !snap.entry_points.is_empty(),
    }
}

fn excerpt(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.trim_end().to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{}\n…(truncated)", cut.trim_end())
}

fn project_label(snap: &ProjectSnapshot) -> String {
    match &snap.framework {
        Some(fw) => format!("{} ({fw})", snap.category),
        None => snap.category.clone(),
    }
}

fn bullet_list(items: &[String], limit: usize) -> String {
    let mut out: Vec<String> = items.iter().take(limit).map(|i| format!("- {i}")).collect();
    if items.len() > limit {
        out.push(format!("- …and {} more", items.len() - limit));
    }
    out.join("\n")
}

fn numbered_list(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {r}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

fn tree_listing(entries: &[String]) -> String {
    entries
        .iter()
        .map(|e| {
            let trimmed = e.trim_end_matches('/');
            let depth = trimmed.matches('/').count();
            let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
            let suffix = if e.ends_with('/') { "/" } else { "" };
            format!("{}{name}{suffix}", "  ".repeat(depth))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn section(snap: &ProjectSnapshot, field: ContextField, instruction_name: &str) -> Option<String> {
    if !has_field(snap, field) {
        return None;
    }
    let body = match field {
        ContextField::Requirements => format!("## Requirements\n{}", numbered_list(&snap.requirements)),
        ContextField::InstructionFile => format!(
            "## {instruction_name}\n{}",
            excerpt(snap.instruction_file.as_deref().unwrap_or_default(), INSTRUCTION_EXCERPT)
        ),
        ContextField::RequirementDocs => {
            format!("## Requirement documents\n{}", bullet_list(&snap.requirement_docs, 10))
        }
        ContextField::ProjectType => format!("## Project\n{}", project_label(snap)),
        ContextField::Dependencies => {
            format!("## Dependencies\n{}", snap.dependencies.join(", "))
        }
        ContextField::FileTree => format!("## Project files\n{}", tree_listing(&snap.file_tree)),
        ContextField::KeyFiles => format!("## Key files\n{}", bullet_list(&snap.key_files, 20)),
        ContextField::EntryPoints => {
            format!("## Entry points\n{}", bullet_list(&snap.entry_points, 20))
        }
    };
    Some(body)
}

fn structured_summary(
    snap: &ProjectSnapshot,
    fields: &[ContextField],
    instruction_name: &str,
) -> Vec<String> {
    fields
        .iter()
        .filter(|f| has_field(snap, **f))
        .map(|f| match f {
            ContextField::ProjectType => format!("Project: {}", project_label(snap)),
            ContextField::Requirements => format!(
                "Requirements:\n{}",
                bullet_list(&snap.requirements, SUMMARY_REQUIREMENTS)
            ),
            ContextField::InstructionFile => {
                format!("Instructions: see {instruction_name} at the project root")
            }
            ContextField::RequirementDocs => {
                format!("Requirement documents: {}", snap.requirement_docs.join(", "))
            }
            ContextField::Dependencies => format!("Dependencies: {}", snap.dependencies.join(", ")),
            ContextField::FileTree => format!("Files: {} entries", snap.file_tree.len()),
            ContextField::KeyFiles => format!("Key files: {}", snap.key_files.join(", ")),
            ContextField::EntryPoints => format!("Entry points: {}", snap.entry_points.join(", ")),
        })
        .collect()
}

/// Render `snap` for `scenario`, appending caller-supplied `extra` context.
pub fn render(
    snap: &ProjectSnapshot,
    scenario: Scenario,
    extra: Option<&str>,
    instruction_name: &str,
) -> ScenarioContext {
    let fields = scenario.fields();
    let empty = !fields.iter().any(|f| has_field(snap, *f));

    let mut parts: Vec<String> = match scenario.shape() {
        ContextShape::DetailedRequirements
            if !has_field(snap, ContextField::Requirements)
                && !has_field(snap, ContextField::InstructionFile) =>
        {
            vec![FALLBACK_GUIDANCE.to_string()]
        }
        ContextShape::StructuredSummary => structured_summary(snap, fields, instruction_name),
        ContextShape::DetailedRequirements
        | ContextShape::TreeListing
        | ContextShape::Comprehensive => fields
            .iter()
            .filter_map(|f| section(snap, *f, instruction_name))
            .collect(),
    };
    if parts.is_empty() {
        parts.push("No project context is available yet.".to_string());
    }
    if let Some(extra) = extra.map(str::trim).filter(|e| !e.is_empty()) {
        parts.push(format!("## Additional context\n{extra}"));
    }

    ScenarioContext {
        scenario,
        shape: scenario.shape(),
        fields: fields.to_vec(),
        text: parts.join("\n\n"),
        empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ProjectSnapshot {
        ProjectSnapshot {
            requirements: vec!["Users can add tasks".into(), "Tasks persist".into()],
            requirement_docs: vec!["PRD.md".into()],
            category: "web-app".into(),
            framework: Some("React".into()),
            file_tree: vec!["src/".into(), "src/main.tsx".into(), "package.json".into()],
            key_files: vec!["package.json".into()],
            entry_points: vec!["src/main.tsx".into()],
            dependencies: vec!["react".into(), "vite".into()],
            instruction_file: Some("Use TypeScript everywhere.".into()),
            ..ProjectSnapshot::empty("/project".into())
        }
    }

    #[test]
    fn scenario_names_parse_with_aliases() {
        assert_eq!(
            "requirements_missing".parse::<Scenario>().unwrap(),
            Scenario::RequirementsMissing
        );
        assert_eq!(
            "claude-md-missing".parse::<Scenario>().unwrap(),
            Scenario::InstructionsMissing
        );
        assert_eq!(Scenario::parse_lenient("something_else"), Scenario::General);
    }

    #[test]
    fn requirements_scenario_without_requirements_renders_fallback() {
        let snap = ProjectSnapshot::empty("/project".into());
        let ctx = render(&snap, Scenario::RequirementsMissing, None, "CLAUDE.md");
        assert_eq!(ctx.text, FALLBACK_GUIDANCE);
        assert!(ctx.empty);
    }

    #[test]
    fn requirements_scenario_lists_requirements_in_order() {
        let ctx = render(&snapshot(), Scenario::RequirementsMissing, None, "CLAUDE.md");
        assert_eq!(ctx.shape, ContextShape::DetailedRequirements);
        assert!(ctx.text.starts_with("## Requirements\n1. Users can add tasks\n2. Tasks persist"));
        assert!(ctx.text.contains("## CLAUDE.md\nUse TypeScript everywhere."));
        assert!(!ctx.empty);
    }

    #[test]
    fn file_confusion_renders_indented_tree() {
        let ctx = render(&snapshot(), Scenario::FileConfusion, None, "CLAUDE.md");
        assert!(ctx.text.contains("## Project files\nsrc/\n  main.tsx\npackage.json"));
        assert!(ctx.text.contains("## Entry points\n- src/main.tsx"));
        assert!(!ctx.text.contains("## Requirements"));
    }

    #[test]
    fn summary_shape_for_clarification() {
        let ctx = render(&snapshot(), Scenario::ClarificationNeeded, None, "CLAUDE.md");
        assert!(ctx.text.starts_with("Requirements:\n- Users can add tasks"));
        assert!(ctx.text.contains("Project: web-app (React)"));
    }

    #[test]
    fn summary_names_the_configured_instruction_file() {
        let ctx = render(&snapshot(), Scenario::ClarificationNeeded, None, "AGENTS.md");
        assert!(ctx.text.contains("Instructions: see AGENTS.md at the project root"));
        assert!(!ctx.text.contains("CLAUDE.md"));
    }

    #[test]
    fn general_includes_everything_and_extra() {
        let ctx = render(&snapshot(), Scenario::General, Some("step: agent_launched"), "CLAUDE.md");
        for heading in ["## Project", "## Requirements", "## Dependencies", "## Project files"] {
            assert!(ctx.text.contains(heading), "missing {heading}");
        }
        assert!(ctx.text.ends_with("## Additional context\nstep: agent_launched"));
    }

    #[test]
    fn long_instruction_file_is_truncated() {
        let mut snap = snapshot();
        snap.instruction_file = Some("x".repeat(INSTRUCTION_EXCERPT + 10));
        let ctx = render(&snap, Scenario::RequirementsMissing, None, "CLAUDE.md");
        assert!(ctx.text.contains("…(truncated)"));
    }
}
