//! Enhanced commands typed into a bridged shell.
//!
//! A completed input line whose first word is `vibe` is offered to the
//! interceptor before it reaches the shell. Handled commands answer on the
//! session's output stream; anything the handler declines is forwarded.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Result;

use crate::bridge::SessionId;
use crate::context::{ContextCache, Scenario};
use crate::intervention::InterventionManager;
use crate::supervisor::SupervisionToggles;
use crate::workflow::WorkflowTracker;

const COMMAND_WORD: &str = "vibe";

const HELP: &str = "\
vibe help                 show this help
vibe status               supervision state for this session
vibe supervise on|off     toggle supervision for this session
vibe context [scenario]   show the project context the supervisor would send
vibe workflows            workflows started from this session
vibe interventions        recent interventions";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub handled: bool,
    pub output: String,
}

impl CommandOutcome {
    pub fn handled(output: impl Into<String>) -> Self {
        Self {
            handled: true,
            output: output.into(),
        }
    }

    /// The line should reach the shell after all.
    pub fn unhandled() -> Self {
        Self {
            handled: false,
            output: String::new(),
        }
    }
}

/// Consulted by the bridge on every completed input line.
pub trait CommandInterceptor: Send + Sync {
    fn matches(&self, line: &str) -> bool;
    fn execute(&self, session: &SessionId, line: &str) -> Result<CommandOutcome>;
}

pub struct EnhancedCommands {
    tracker: Arc<WorkflowTracker>,
    context: Arc<ContextCache>,
    interventions: Arc<InterventionManager>,
    toggles: Arc<SupervisionToggles>,
}

impl EnhancedCommands {
    pub fn new(
        tracker: Arc<WorkflowTracker>,
        context: Arc<ContextCache>,
        interventions: Arc<InterventionManager>,
        toggles: Arc<SupervisionToggles>,
    ) -> Self {
        Self {
            tracker,
            context,
            interventions,
            toggles,
        }
    }

    fn status(&self, session: &SessionId) -> String {
        let mut out = String::new();
        let global = if self.toggles.global() { "on" } else { "off" };
        let here = if self.toggles.is_enabled_for(session) {
            "on"
        } else {
            "off"
        };
        let _ = writeln!(out, "supervision: {here} (global: {global})");
        match self
            .tracker
            .active_workflow_for_session(session)
            .and_then(|id| self.tracker.get(&id))
        {
            Some(wf) => {
                let _ = writeln!(
                    out,
                    "workflow: {} [{}] step: {}",
                    wf.kind,
                    wf.status.as_str(),
                    wf.current_step().unwrap_or("-")
                );
            }
            None => out.push_str("workflow: none\n"),
        }
        let stats = self.interventions.stats();
        let _ = write!(
            out,
            "interventions: {} total, {} awaiting approval",
            stats.total, stats.pending_approvals
        );
        out
    }

    fn supervise(&self, session: &SessionId, arg: Option<&str>) -> String {
        match arg {
            Some("on") => {
                self.toggles.set_session(session, true);
                "supervision enabled for this session".to_string()
            }
            Some("off") => {
                self.toggles.set_session(session, false);
                "supervision disabled for this session".to_string()
            }
            _ => "usage: vibe supervise on|off".to_string(),
        }
    }

    fn workflows(&self, session: &SessionId) -> String {
        let ids = self.tracker.workflows_for_session(session);
        if ids.is_empty() {
            return "no workflows for this session".to_string();
        }
        ids.iter()
            .filter_map(|id| self.tracker.get(id))
            .map(|wf| {
                format!(
                    "{}  {}  {}/{} steps  {}",
                    wf.id,
                    wf.kind,
                    wf.completed.len(),
                    wf.steps().len(),
                    wf.status.as_str()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn recent_interventions(&self) -> String {
        let recent = self.interventions.recent(5);
        if recent.is_empty() {
            return "no interventions yet".to_string();
        }
        recent
            .iter()
            .map(|r| {
                format!(
                    "{}  {}  {:?}  {}ms",
                    r.at.format("%H:%M:%S"),
                    r.kind,
                    r.outcome,
                    r.duration_ms
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl CommandInterceptor for EnhancedCommands {
    fn matches(&self, line: &str) -> bool {
        line.split_whitespace().next() == Some(COMMAND_WORD)
    }

    fn execute(&self, session: &SessionId, line: &str) -> Result<CommandOutcome> {
        let mut words = line.split_whitespace().skip(1);
        let outcome = match words.next() {
            None | Some("help") => CommandOutcome::handled(HELP),
            Some("status") => CommandOutcome::handled(self.status(session)),
            Some("supervise") => CommandOutcome::handled(self.supervise(session, words.next())),
            Some("context") => {
                let scenario = words
                    .next()
                    .map(Scenario::parse_lenient)
                    .unwrap_or(Scenario::General);
                CommandOutcome::handled(self.context.get_context_for(scenario, None).text)
            }
            Some("workflows") => CommandOutcome::handled(self.workflows(session)),
            Some("interventions") => CommandOutcome::handled(self.recent_interventions()),
            Some(_) => CommandOutcome::unhandled(),
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::events::EventBus;
    use crate::intervention::{InterventionKind, InterventionRequest};
    use crate::workflow::WorkflowKind;
    use std::time::Duration;

    struct Fixture {
        commands: EnhancedCommands,
        tracker: Arc<WorkflowTracker>,
        interventions: Arc<InterventionManager>,
        toggles: Arc<SupervisionToggles>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("PRD.md"), "- Dark mode\n").unwrap();
        let bus = EventBus::new();
        let context = Arc::new(ContextCache::new(dir.path(), ContextConfig::default()));
        let tracker = Arc::new(WorkflowTracker::new(Duration::from_secs(60), bus.clone()));
        let interventions = Arc::new(InterventionManager::new(context.clone(), bus, 100));
        let toggles = Arc::new(SupervisionToggles::new(true));
        Fixture {
            commands: EnhancedCommands::new(
                tracker.clone(),
                context,
                interventions.clone(),
                toggles.clone(),
            ),
            tracker,
            interventions,
            toggles,
            _dir: dir,
        }
    }

    fn run(f: &Fixture, line: &str) -> CommandOutcome {
        f.commands.execute(&SessionId::from("s1"), line).unwrap()
    }

    #[test]
    fn matches_only_the_command_word() {
        let f = fixture();
        assert!(f.commands.matches("vibe status"));
        assert!(f.commands.matches("  vibe"));
        assert!(!f.commands.matches("vibes"));
        assert!(!f.commands.matches("echo vibe"));
        assert!(!f.commands.matches(""));
    }

    #[test]
    fn help_is_default() {
        let f = fixture();
        assert_eq!(run(&f, "vibe"), CommandOutcome::handled(HELP));
        assert!(run(&f, "vibe help").output.contains("vibe supervise on|off"));
    }

    #[test]
    fn unknown_subcommand_falls_through() {
        let f = fixture();
        assert!(!run(&f, "vibe deploy --prod").handled);
    }

    #[test]
    fn supervise_toggles_this_session_only() {
        let f = fixture();
        let s1 = SessionId::from("s1");
        let s2 = SessionId::from("s2");
        run(&f, "vibe supervise off");
        assert!(!f.toggles.is_enabled_for(&s1));
        assert!(f.toggles.is_enabled_for(&s2));
        assert!(run(&f, "vibe status").output.starts_with("supervision: off (global: on)"));

        run(&f, "vibe supervise on");
        assert!(f.toggles.is_enabled_for(&s1));
        assert!(run(&f, "vibe supervise").output.starts_with("usage"));
    }

    #[test]
    fn status_reports_active_workflow() {
        let f = fixture();
        let id = f.tracker.start_workflow(
            WorkflowKind::ProjectSetup,
            Some(SessionId::from("s1")),
            serde_json::Value::Null,
        );
        f.tracker
            .complete_step(&id, "directory_created", serde_json::Value::Null)
            .unwrap();
        let out = run(&f, "vibe status").output;
        assert!(out.contains("workflow: project_setup [active] step: dependencies_installed"));
        assert!(run(&f, "vibe workflows").output.contains("1/3 steps"));
    }

    #[test]
    fn context_renders_requested_scenario() {
        let f = fixture();
        let out = run(&f, "vibe context requirements_missing").output;
        assert!(out.contains("1. Dark mode"));
    }

    #[test]
    fn interventions_lists_recent() {
        let f = fixture();
        assert_eq!(run(&f, "vibe interventions").output, "no interventions yet");
        f.interventions
            .process(InterventionRequest::new(InterventionKind::FileConfusion));
        assert!(run(&f, "vibe interventions").output.contains("file_confusion"));
    }
}
