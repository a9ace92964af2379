//! Intervention manager.
//!
//! Turns a detected problem into a response the agent can act on: text to
//! inject, an instruction file written to the project root, or a permission
//! request that waits for a human. Every call to [`InterventionManager::process`]
//! leaves exactly one [`InterventionRecord`]; synthesis failures degrade to a
//! fixed fallback response instead of propagating.

pub mod strategy;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bridge::SessionId;
use crate::context::{ContextCache, ProjectSnapshot, Scenario};
use crate::error::InterventionError;
use crate::events::{Event, EventBus, InterventionEvent};
use crate::workflow::WorkflowId;

pub use strategy::{Delivery, InterventionKind, Priority, Strategy, render_template, strategy_for};

/// Sent when a response could not be synthesized.
pub const FALLBACK_RESPONSE: &str = "It looks like you may be stuck. Review the README and the \
project documents at the project root, then describe exactly what information you need to continue.";

#[derive(Debug, Clone, Serialize)]
pub struct InterventionRequest {
    pub kind: InterventionKind,
    pub session_id: Option<SessionId>,
    pub workflow_id: Option<WorkflowId>,
    pub step: Option<String>,
    /// The agent output that triggered the request.
    pub signal: Option<String>,
    /// Action a permission request asks for.
    pub action: Option<String>,
    pub files: Vec<String>,
}

impl InterventionRequest {
    pub fn new(kind: InterventionKind) -> Self {
        Self {
            kind,
            session_id: None,
            workflow_id: None,
            step: None,
            signal: None,
            action: None,
            files: Vec::new(),
        }
    }

    pub fn session(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn workflow(mut self, id: WorkflowId) -> Self {
        self.workflow_id = Some(id);
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn signal(mut self, signal: impl Into<String>) -> Self {
        self.signal = Some(signal.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>, files: Vec<String>) -> Self {
        self.action = Some(action.into());
        self.files = files;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterventionAction {
    InjectText {
        text: String,
    },
    WriteFile {
        path: PathBuf,
        bytes: usize,
    },
    PermissionRequest {
        approval_id: String,
        action: String,
        files: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct InterventionResponse {
    pub id: String,
    pub kind: InterventionKind,
    pub priority: Priority,
    pub delivery: Delivery,
    pub session_id: Option<SessionId>,
    pub text: String,
    pub actions: Vec<InterventionAction>,
    pub fallback: bool,
}

impl InterventionResponse {
    /// Text to type into the session, if this response injects anything.
    pub fn inject_text(&self) -> Option<&str> {
        self.actions.iter().find_map(|a| match a {
            InterventionAction::InjectText { text } if !text.is_empty() => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn approval_id(&self) -> Option<&str> {
        self.actions.iter().find_map(|a| match a {
            InterventionAction::PermissionRequest { approval_id, .. } => Some(approval_id.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
    AwaitingApproval,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterventionRecord {
    pub id: String,
    pub kind: InterventionKind,
    pub delivery: Delivery,
    pub session_id: Option<SessionId>,
    pub workflow_id: Option<WorkflowId>,
    pub response: String,
    pub duration_ms: u64,
    pub outcome: Outcome,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub approval_id: String,
    pub record_id: String,
    pub session_id: Option<SessionId>,
    pub action: String,
    pub files: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalResolution {
    pub approval_id: String,
    pub session_id: Option<SessionId>,
    pub approved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterventionStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub by_kind: BTreeMap<String, u64>,
    pub average_duration_ms: f64,
    pub pending_approvals: usize,
}

/// Cumulative counters; unlike the record window these never roll over.
#[derive(Default)]
struct Tally {
    total: u64,
    completed: u64,
    failed: u64,
    by_kind: BTreeMap<String, u64>,
    duration_ms: u64,
}

impl Tally {
    fn outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::AwaitingApproval => {}
        }
    }
}

pub struct InterventionManager {
    context: Arc<ContextCache>,
    events: EventBus,
    history_cap: usize,
    records: Mutex<VecDeque<InterventionRecord>>,
    pending: Mutex<HashMap<String, PendingApproval>>,
    tally: Mutex<Tally>,
}

impl InterventionManager {
    pub fn new(context: Arc<ContextCache>, events: EventBus, history_cap: usize) -> Self {
        Self {
            context,
            events,
            history_cap,
            records: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            tally: Mutex::new(Tally::default()),
        }
    }

    /// Synthesize and record a response for `request`. Never fails.
    pub fn process(&self, request: InterventionRequest) -> InterventionResponse {
        let started = Instant::now();
        let id = uuid::Uuid::new_v4().to_string();

        let response = match self.synthesize(&id, &request) {
            Ok(response) => response,
            Err(e) => {
                warn!(kind = %request.kind, error = %format!("{e:#}"), "intervention synthesis failed; using fallback");
                self.fallback(&id, &request)
            }
        };

        let outcome = if response.fallback {
            Outcome::Failed
        } else if response.delivery == Delivery::PermissionRequest {
            Outcome::AwaitingApproval
        } else {
            Outcome::Completed
        };

        if let Some(InterventionAction::PermissionRequest {
            approval_id,
            action,
            files,
        }) = response
            .actions
            .iter()
            .find(|a| matches!(a, InterventionAction::PermissionRequest { .. }))
        {
            self.pending.lock().unwrap().insert(
                approval_id.clone(),
                PendingApproval {
                    approval_id: approval_id.clone(),
                    record_id: id.clone(),
                    session_id: request.session_id.clone(),
                    action: action.clone(),
                    files: files.clone(),
                    requested_at: Utc::now(),
                },
            );
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.record(InterventionRecord {
            id: id.clone(),
            kind: request.kind,
            delivery: response.delivery,
            session_id: request.session_id.clone(),
            workflow_id: request.workflow_id.clone(),
            response: response.text.clone(),
            duration_ms,
            outcome,
            at: Utc::now(),
        });

        info!(
            id = %id,
            kind = %request.kind,
            delivery = ?response.delivery,
            outcome = ?outcome,
            duration_ms,
            "intervention processed"
        );
        self.announce(&response);
        response
    }

    fn record(&self, record: InterventionRecord) {
        {
            let mut tally = self.tally.lock().unwrap();
            tally.total += 1;
            tally.duration_ms += record.duration_ms;
            *tally.by_kind.entry(record.kind.to_string()).or_default() += 1;
            tally.outcome(record.outcome);
        }
        let mut records = self.records.lock().unwrap();
        records.push_back(record);
        while records.len() > self.history_cap {
            records.pop_front();
        }
    }

    fn announce(&self, response: &InterventionResponse) {
        for action in &response.actions {
            match action {
                InterventionAction::PermissionRequest {
                    approval_id,
                    action,
                    files,
                } => self.events.publish(Event::Intervention(
                    InterventionEvent::PermissionRequested {
                        approval_id: approval_id.clone(),
                        session_id: response.session_id.clone(),
                        action: action.clone(),
                        files: files.clone(),
                    },
                )),
                InterventionAction::InjectText { text } => self.events.publish(Event::Intervention(
                    InterventionEvent::InterventionReady {
                        intervention_id: response.id.clone(),
                        session_id: response.session_id.clone(),
                        kind: response.kind,
                        text: text.clone(),
                    },
                )),
                InterventionAction::WriteFile { .. } => {}
            }
        }
    }

    /// The triggering output stays out of the response text: once typed
    /// into the session it would come back as output and match again.
    fn extra_context(request: &InterventionRequest) -> Option<String> {
        request
            .step
            .as_ref()
            .map(|step| format!("Current step: {step}"))
    }

    fn synthesize(&self, id: &str, request: &InterventionRequest) -> Result<InterventionResponse> {
        let strategy = strategy_for(request.kind);
        let file_name = self
            .context
            .instruction_file_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "CLAUDE.md".to_string());
        let step = request.step.as_deref().unwrap_or("the current step");
        let extra = Self::extra_context(request);

        let mut actions = Vec::new();
        let text = match strategy.delivery {
            Delivery::Text => {
                let ctx = self.context.get_context_for(strategy.scenario, extra.as_deref());
                render_template(
                    strategy.template,
                    &[
                        ("context", &ctx.text),
                        ("step", step),
                        ("file", &file_name),
                    ],
                )
            }
            Delivery::InstructionFile => {
                let path = self.context.instruction_file_path();
                match OpenOptions::new().write(true).create_new(true).open(&path) {
                    Ok(mut file) => {
                        let content = build_instruction_file(&self.context.snapshot());
                        file.write_all(content.as_bytes())
                            .with_context(|| format!("failed to write {}", path.display()))?;
                        info!(path = %path.display(), bytes = content.len(), "wrote instruction file");
                        actions.push(InterventionAction::WriteFile {
                            path: path.clone(),
                            bytes: content.len(),
                        });
                        self.context.refresh();
                        let ctx = self.context.get_context_for(strategy.scenario, None);
                        render_template(
                            strategy.template,
                            &[("file", &file_name), ("context", &ctx.text)],
                        )
                    }
                    // Never clobber instructions a human wrote; point at them instead.
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        let ctx = self
                            .context
                            .get_context_for(Scenario::RequirementsMissing, extra.as_deref());
                        format!(
                            "Project instructions are in {file_name} at the project root. Please read it and continue.\n\n{}",
                            ctx.text
                        )
                    }
                    Err(e) => {
                        return Err(e).with_context(|| format!("failed to create {}", path.display()));
                    }
                }
            }
            Delivery::PermissionRequest => {
                let action = request
                    .action
                    .clone()
                    .or_else(|| request.signal.clone())
                    .unwrap_or_else(|| "unspecified action".to_string());
                actions.push(InterventionAction::PermissionRequest {
                    approval_id: uuid::Uuid::new_v4().to_string(),
                    action: action.clone(),
                    files: request.files.clone(),
                });
                render_template(strategy.template, &[("signal", &action)])
            }
        };

        if strategy.delivery != Delivery::PermissionRequest {
            actions.push(InterventionAction::InjectText { text: text.clone() });
        }

        Ok(InterventionResponse {
            id: id.to_string(),
            kind: request.kind,
            priority: strategy.priority,
            delivery: strategy.delivery,
            session_id: request.session_id.clone(),
            text,
            actions,
            fallback: false,
        })
    }

    fn fallback(&self, id: &str, request: &InterventionRequest) -> InterventionResponse {
        InterventionResponse {
            id: id.to_string(),
            kind: request.kind,
            priority: Priority::Low,
            delivery: Delivery::Text,
            session_id: request.session_id.clone(),
            text: FALLBACK_RESPONSE.to_string(),
            actions: vec![InterventionAction::InjectText {
                text: FALLBACK_RESPONSE.to_string(),
            }],
            fallback: true,
        }
    }

    /// Apply a human decision to a pending permission request.
    pub fn resolve_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> Result<ApprovalResolution, InterventionError> {
        let pending = self
            .pending
            .lock()
            .unwrap()
            .remove(approval_id)
            .ok_or_else(|| InterventionError::ApprovalNotFound(approval_id.to_string()))?;
        let approved = decision == ApprovalDecision::Approve;
        let outcome = if approved {
            Outcome::Completed
        } else {
            Outcome::Failed
        };

        if let Some(record) = self
            .records
            .lock()
            .unwrap()
            .iter_mut()
            .find(|r| r.id == pending.record_id)
        {
            record.outcome = outcome;
        }
        self.tally.lock().unwrap().outcome(outcome);

        info!(approval = approval_id, approved, action = %pending.action, "approval resolved");
        let resolution = ApprovalResolution {
            approval_id: approval_id.to_string(),
            session_id: pending.session_id,
            approved,
        };
        self.events
            .publish(Event::Intervention(InterventionEvent::ApprovalResolved {
                approval_id: resolution.approval_id.clone(),
                session_id: resolution.session_id.clone(),
                approved,
            }));
        Ok(resolution)
    }

    pub fn resolve_approvals(
        &self,
        approval_ids: &[String],
        decision: ApprovalDecision,
    ) -> Vec<Result<ApprovalResolution, InterventionError>> {
        approval_ids
            .iter()
            .map(|id| self.resolve_approval(id, decision))
            .collect()
    }

    /// Drop the approvals a terminated session was waiting on. Their records
    /// count as failed; nothing is left to answer.
    pub fn abandon_session_approvals(&self, session: &SessionId) -> usize {
        let abandoned: Vec<PendingApproval> = {
            let mut pending = self.pending.lock().unwrap();
            let ids: Vec<String> = pending
                .values()
                .filter(|p| p.session_id.as_ref() == Some(session))
                .map(|p| p.approval_id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        if abandoned.is_empty() {
            return 0;
        }

        {
            let mut records = self.records.lock().unwrap();
            for record in records
                .iter_mut()
                .filter(|r| abandoned.iter().any(|p| p.record_id == r.id))
            {
                record.outcome = Outcome::Failed;
            }
        }
        let mut tally = self.tally.lock().unwrap();
        for _ in &abandoned {
            tally.outcome(Outcome::Failed);
        }
        info!(session = %session, count = abandoned.len(), "abandoned approvals for terminated session");
        abandoned.len()
    }

    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        let mut pending: Vec<_> = self.pending.lock().unwrap().values().cloned().collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        pending
    }

    /// Newest records first.
    pub fn recent(&self, n: usize) -> Vec<InterventionRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn stats(&self) -> InterventionStats {
        let tally = self.tally.lock().unwrap();
        let total = tally.total;
        InterventionStats {
            total,
            completed: tally.completed,
            failed: tally.failed,
            success_rate: if total == 0 {
                0.0
            } else {
                tally.completed as f64 / total as f64
            },
            by_kind: tally.by_kind.clone(),
            average_duration_ms: if total == 0 {
                0.0
            } else {
                tally.duration_ms as f64 / total as f64
            },
            pending_approvals: self.pending.lock().unwrap().len(),
        }
    }
}

/// Instruction file generated from the project snapshot.
pub fn build_instruction_file(snap: &ProjectSnapshot) -> String {
    let mut out = String::from(
        "# Project Instructions\n\nGenerated from the project's documents. Edit freely to refine guidance.\n",
    );

    out.push_str("\n## Project\n");
    match &snap.framework {
        Some(fw) => out.push_str(&format!("{} built with {fw}\n", snap.category)),
        None => out.push_str(&format!("{}\n", snap.category)),
    }

    out.push_str("\n## Requirements\n");
    if snap.requirements.is_empty() {
        out.push_str("No written requirements were found. Ask the user what to build before writing code.\n");
    } else {
        for (i, r) in snap.requirements.iter().enumerate() {
            out.push_str(&format!("{}. {r}\n", i + 1));
        }
    }

    if !snap.dependencies.is_empty() {
        out.push_str(&format!("\n## Dependencies\n{}\n", snap.dependencies.join(", ")));
    }
    if !snap.key_files.is_empty() {
        out.push_str("\n## Key files\n");
        for f in &snap.key_files {
            out.push_str(&format!("- {f}\n"));
        }
    }
    if !snap.entry_points.is_empty() {
        out.push_str("\n## Entry points\n");
        for f in &snap.entry_points {
            out.push_str(&format!("- {f}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use std::fs;
    use std::path::Path;

    fn manager_for(root: &Path) -> (InterventionManager, EventBus) {
        let bus = EventBus::new();
        let context = Arc::new(ContextCache::new(root, ContextConfig::default()));
        (InterventionManager::new(context, bus.clone(), 100), bus)
    }

    // ── Synthesis ──

    #[test]
    fn requirements_missing_uses_project_requirements() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("PRD.md"), "1. Users can export CSV\n").unwrap();
        let (manager, _) = manager_for(tmp.path());

        let response = manager.process(
            InterventionRequest::new(InterventionKind::RequirementsMissing)
                .session(SessionId::from("s1")),
        );
        assert!(!response.fallback);
        assert_eq!(response.priority, Priority::High);
        assert!(response.text.contains("1. Users can export CSV"));
        assert_eq!(response.inject_text(), Some(response.text.as_str()));
    }

    #[test]
    fn requirements_missing_without_documents_gives_guidance() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager_for(tmp.path());
        let response =
            manager.process(InterventionRequest::new(InterventionKind::RequirementsMissing));
        assert!(response.text.contains(crate::context::FALLBACK_GUIDANCE));
    }

    #[test]
    fn missing_instructions_writes_file_and_refreshes_context() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("PRD.md"), "- Offline support\n").unwrap();
        let (manager, _) = manager_for(tmp.path());
        let generation_before = manager.context.snapshot().generation;

        let response =
            manager.process(InterventionRequest::new(InterventionKind::MissingInstructions));
        let written = fs::read_to_string(tmp.path().join("CLAUDE.md")).unwrap();
        assert!(written.contains("1. Offline support"));
        assert!(matches!(
            response.actions[0],
            InterventionAction::WriteFile { .. }
        ));
        assert!(response.text.contains("CLAUDE.md"));
        let snap = manager.context.snapshot();
        assert!(snap.generation > generation_before);
        assert!(snap.instruction_file.is_some());
    }

    #[test]
    fn existing_instruction_file_is_not_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("CLAUDE.md"), "hand written").unwrap();
        let (manager, _) = manager_for(tmp.path());
        let response =
            manager.process(InterventionRequest::new(InterventionKind::MissingInstructions));
        assert_eq!(
            fs::read_to_string(tmp.path().join("CLAUDE.md")).unwrap(),
            "hand written"
        );
        assert!(
            !response
                .actions
                .iter()
                .any(|a| matches!(a, InterventionAction::WriteFile { .. }))
        );
    }

    #[test]
    fn instruction_file_created_after_scan_is_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager_for(tmp.path());
        assert!(manager.context.snapshot().instruction_file.is_none());
        fs::write(tmp.path().join("CLAUDE.md"), "written meanwhile").unwrap();

        let response =
            manager.process(InterventionRequest::new(InterventionKind::MissingInstructions));
        assert!(!response.fallback);
        assert_eq!(
            fs::read_to_string(tmp.path().join("CLAUDE.md")).unwrap(),
            "written meanwhile"
        );
        assert!(response.text.starts_with("Project instructions are in CLAUDE.md"));
    }

    #[test]
    fn response_text_leaves_out_triggering_output() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager_for(tmp.path());
        for kind in [
            InterventionKind::ClarificationNeeded,
            InterventionKind::FileConfusion,
            InterventionKind::GeneralConfusion,
        ] {
            let response = manager.process(
                InterventionRequest::new(kind)
                    .step("dependencies_installed")
                    .signal("ls: cannot access 'zz': No such file or directory"),
            );
            assert!(!response.text.contains("cannot access"), "{kind}");
        }
    }

    #[test]
    fn synthesis_failure_returns_fallback_and_records_failure() {
        let (manager, _) = manager_for(Path::new("/definitely/not/a/project"));
        let response =
            manager.process(InterventionRequest::new(InterventionKind::MissingInstructions));
        assert!(response.fallback);
        assert_eq!(response.text, FALLBACK_RESPONSE);
        let records = manager.recent(1);
        assert_eq!(records[0].outcome, Outcome::Failed);
        assert_eq!(manager.stats().failed, 1);
    }

    #[test]
    fn stuck_response_names_the_step() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager_for(tmp.path());
        let response = manager.process(
            InterventionRequest::new(InterventionKind::WorkflowStuck).step("agent_launched"),
        );
        assert!(response.text.contains("'agent_launched'"));
    }

    // ── Permission flow ──

    #[test]
    fn permission_request_waits_for_approval() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, bus) = manager_for(tmp.path());
        let rx = bus.subscribe();

        let response = manager.process(
            InterventionRequest::new(InterventionKind::PermissionRequired)
                .session(SessionId::from("s1"))
                .action("delete build/", vec!["build/".to_string()]),
        );
        assert!(response.inject_text().is_none());
        let approval_id = response.approval_id().unwrap().to_string();
        assert_eq!(manager.recent(1)[0].outcome, Outcome::AwaitingApproval);
        assert_eq!(manager.stats().pending_approvals, 1);

        let requested = rx.try_iter().any(|e| {
            matches!(e, Event::Intervention(InterventionEvent::PermissionRequested { ref action, .. }) if action == "delete build/")
        });
        assert!(requested);

        let resolution = manager
            .resolve_approval(&approval_id, ApprovalDecision::Approve)
            .unwrap();
        assert!(resolution.approved);
        assert_eq!(resolution.session_id, Some(SessionId::from("s1")));
        assert_eq!(manager.recent(1)[0].outcome, Outcome::Completed);
        assert_eq!(manager.stats().pending_approvals, 0);

        assert!(matches!(
            manager.resolve_approval(&approval_id, ApprovalDecision::Approve),
            Err(InterventionError::ApprovalNotFound(_))
        ));
    }

    #[test]
    fn batch_rejection() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager_for(tmp.path());
        let ids: Vec<String> = (0..2)
            .map(|i| {
                manager
                    .process(
                        InterventionRequest::new(InterventionKind::PermissionRequired)
                            .action(format!("write file {i}"), vec![]),
                    )
                    .approval_id()
                    .unwrap()
                    .to_string()
            })
            .collect();
        let mut all = ids.clone();
        all.push("unknown".to_string());

        let results = manager.resolve_approvals(&all, ApprovalDecision::Reject);
        assert!(results[0].as_ref().is_ok_and(|r| !r.approved));
        assert!(results[1].is_ok());
        assert!(results[2].is_err());
        assert_eq!(manager.stats().failed, 2);
    }

    #[test]
    fn terminated_session_abandons_its_approvals() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, bus) = manager_for(tmp.path());
        let rx = bus.subscribe();
        for session in ["s1", "s1", "s2"] {
            manager.process(
                InterventionRequest::new(InterventionKind::PermissionRequired)
                    .session(SessionId::from(session))
                    .action("run tests", vec![]),
            );
        }

        assert_eq!(manager.abandon_session_approvals(&SessionId::from("s1")), 2);
        let pending = manager.pending_approvals();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].session_id, Some(SessionId::from("s2")));
        assert_eq!(manager.stats().failed, 2);
        assert_eq!(manager.recent(3)[2].outcome, Outcome::Failed);
        assert_eq!(manager.abandon_session_approvals(&SessionId::from("s1")), 0);
        assert!(!rx.try_iter().any(|e| matches!(
            e,
            Event::Intervention(InterventionEvent::ApprovalResolved { .. })
        )));
    }

    // ── Records and statistics ──

    #[test]
    fn records_bounded_to_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager_for(tmp.path());
        for _ in 0..101 {
            manager.process(InterventionRequest::new(InterventionKind::GeneralConfusion));
        }
        assert_eq!(manager.record_count(), 100);
        assert_eq!(manager.stats().total, 101);
    }

    #[test]
    fn stats_count_by_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager_for(tmp.path());
        manager.process(InterventionRequest::new(InterventionKind::FileConfusion));
        manager.process(InterventionRequest::new(InterventionKind::FileConfusion));
        manager.process(InterventionRequest::new(InterventionKind::GeneralConfusion));

        let stats = manager.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_kind.get("file_confusion"), Some(&2));
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
        let recent = manager.recent(2);
        assert_eq!(recent[0].kind, InterventionKind::GeneralConfusion);
        assert_eq!(recent[1].kind, InterventionKind::FileConfusion);
    }

    #[test]
    fn instruction_file_lists_requirements() {
        let mut snap = ProjectSnapshot::empty("/p".into());
        assert!(build_instruction_file(&snap).contains("No written requirements"));
        snap.requirements = vec!["Login".into()];
        snap.framework = Some("React".into());
        snap.category = "web-app".into();
        let content = build_instruction_file(&snap);
        assert!(content.contains("web-app built with React"));
        assert!(content.contains("1. Login"));
    }
}
