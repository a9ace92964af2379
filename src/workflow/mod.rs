//! Workflow tracker.
//!
//! A workflow is a named sequence of milestone steps started on behalf of a
//! session (launching an agent, setting up a project, generating a PRD). The
//! tracker records step completion, failures and timeouts, and turns the
//! ones that warrant help into [`WorkflowEvent`]s for the supervisor.
//!
//! ## Status transitions
//!
//! ```text
//! Active ──all steps done──▶ Completed (terminal)
//!   │ ▲
//!   │ └──step completed──┐
//!   ├──timeout──▶ Stuck ─┤
//!   └──failure──▶ Failed ┘
//! ```
//!
//! Each workflow sits behind its own lock; the id map is only locked long
//! enough to clone the handle.

pub mod classify;
pub mod kinds;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bridge::SessionId;
use crate::error::WorkflowError;
use crate::events::{Event, EventBus, WorkflowEvent};

pub use classify::{ConfusionCategory, ErrorClass, FailureSeverity};
pub use kinds::WorkflowKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkflowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Stuck,
    Failed,
    Completed,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Active => "active",
            WorkflowStatus::Stuck => "stuck",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedStep {
    pub step: String,
    pub at: DateTime<Utc>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub step: String,
    pub error: String,
    pub class: ErrorClass,
    pub severity: FailureSeverity,
    pub context: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub kind: WorkflowKind,
    pub session_id: Option<SessionId>,
    pub metadata: serde_json::Value,
    pub status: WorkflowStatus,
    pub completed: Vec<CompletedStep>,
    pub failures: Vec<FailureRecord>,
    pub interventions: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    seq: u64,
    #[serde(skip)]
    last_progress: Instant,
}

impl Workflow {
    pub fn steps(&self) -> Vec<&'static str> {
        self.kind.step_names()
    }

    pub fn is_step_complete(&self, step: &str) -> bool {
        self.completed.iter().any(|c| c.step == step)
    }

    /// The first step in order that has not completed yet.
    pub fn current_step(&self) -> Option<&'static str> {
        self.kind
            .step_names()
            .into_iter()
            .find(|s| !self.is_step_complete(s))
    }

    pub fn all_steps_complete(&self) -> bool {
        self.kind
            .step_names()
            .iter()
            .all(|s| self.is_step_complete(s))
    }

    pub fn since_progress(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_progress)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FailurePoint {
    pub kind: WorkflowKind,
    pub step: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStats {
    pub total: usize,
    pub active: usize,
    pub stuck: usize,
    pub failed: usize,
    pub completed: usize,
    pub success_rate: f64,
    pub top_failures: Vec<FailurePoint>,
    pub interventions_per_completed: f64,
}

pub struct WorkflowTracker {
    workflows: RwLock<HashMap<WorkflowId, Arc<Mutex<Workflow>>>>,
    default_timeout: Duration,
    events: EventBus,
    seq: AtomicU64,
}

impl WorkflowTracker {
    pub fn new(default_timeout: Duration, events: EventBus) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            default_timeout,
            events,
            seq: AtomicU64::new(0),
        }
    }

    fn handle(&self, id: &WorkflowId) -> Result<Arc<Mutex<Workflow>>, WorkflowError> {
        self.workflows
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::WorkflowNotFound(id.clone()))
    }

    fn handles(&self) -> Vec<Arc<Mutex<Workflow>>> {
        self.workflows.read().unwrap().values().cloned().collect()
    }

    fn publish(&self, event: &WorkflowEvent) {
        self.events.publish(Event::Workflow(event.clone()));
    }

    pub fn start_workflow(
        &self,
        kind: WorkflowKind,
        session_id: Option<SessionId>,
        metadata: serde_json::Value,
    ) -> WorkflowId {
        let started_at = Utc::now();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let origin = session_id
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "detached".to_string());
        let id = WorkflowId(format!(
            "{kind}-{origin}-{}-{seq}",
            started_at.timestamp_millis()
        ));

        let workflow = Workflow {
            id: id.clone(),
            kind,
            session_id: session_id.clone(),
            metadata,
            status: WorkflowStatus::Active,
            completed: Vec::new(),
            failures: Vec::new(),
            interventions: 0,
            started_at,
            seq,
            last_progress: Instant::now(),
        };
        self.workflows
            .write()
            .unwrap()
            .insert(id.clone(), Arc::new(Mutex::new(workflow)));

        info!(workflow = %id, kind = %kind, "workflow started");
        self.publish(&WorkflowEvent::Started {
            workflow_id: id.clone(),
            kind,
            session_id,
        });
        id
    }

    /// Mark `step` complete. Returns false if the step is not part of the
    /// workflow or was already completed.
    pub fn complete_step(
        &self,
        id: &WorkflowId,
        step: &str,
        data: serde_json::Value,
    ) -> Result<bool, WorkflowError> {
        let handle = self.handle(id)?;
        let completed_all = {
            let mut wf = handle.lock().unwrap();
            if !wf.kind.has_step(step) || wf.is_step_complete(step) {
                debug!(workflow = %id, step, "step unknown or already complete");
                return Ok(false);
            }
            wf.completed.push(CompletedStep {
                step: step.to_string(),
                at: Utc::now(),
                data,
            });
            wf.last_progress = Instant::now();
            if wf.all_steps_complete() {
                wf.status = WorkflowStatus::Completed;
                true
            } else {
                wf.status = WorkflowStatus::Active;
                false
            }
        };

        info!(workflow = %id, step, "workflow step completed");
        self.publish(&WorkflowEvent::StepCompleted {
            workflow_id: id.clone(),
            step: step.to_string(),
        });
        if completed_all {
            info!(workflow = %id, "workflow completed");
            self.publish(&WorkflowEvent::Completed {
                workflow_id: id.clone(),
            });
        }
        Ok(true)
    }

    /// Record a failure. Returns the escalation event when the failure is on
    /// a critical step or names something an intervention can supply.
    pub fn report_failure(
        &self,
        id: &WorkflowId,
        step: &str,
        error: &str,
        context: serde_json::Value,
    ) -> Result<Option<WorkflowEvent>, WorkflowError> {
        let handle = self.handle(id)?;
        let class = ErrorClass::of(error);
        let (severity, session_id) = {
            let mut wf = handle.lock().unwrap();
            let severity = FailureSeverity::classify(wf.kind.is_critical(step), class);
            wf.failures.push(FailureRecord {
                step: step.to_string(),
                error: error.to_string(),
                class,
                severity,
                context,
                at: Utc::now(),
            });
            if wf.status != WorkflowStatus::Completed {
                wf.status = WorkflowStatus::Failed;
            }
            (severity, wf.session_id.clone())
        };

        if !severity.needs_intervention() {
            debug!(workflow = %id, step, error, "minor failure recorded");
            return Ok(None);
        }

        warn!(workflow = %id, step, error, severity = ?severity, "workflow step failed");
        let event = WorkflowEvent::Failure {
            workflow_id: id.clone(),
            session_id,
            step: step.to_string(),
            error: error.to_string(),
            severity,
            suggested: Some(class.suggested_intervention()),
        };
        self.publish(&event);
        Ok(Some(event))
    }

    fn timeout_for(&self, kind: WorkflowKind, step: &str) -> Duration {
        kind.step_timeout(step).unwrap_or(self.default_timeout)
    }

    /// Mark `wf` stuck on `step` if `elapsed` strictly exceeds the step's
    /// timeout. Called with the workflow locked.
    fn mark_stuck(
        &self,
        wf: &mut Workflow,
        step: &str,
        elapsed: Duration,
    ) -> Option<WorkflowEvent> {
        if wf.status == WorkflowStatus::Completed {
            return None;
        }
        let timeout = self.timeout_for(wf.kind, step);
        if elapsed <= timeout {
            return None;
        }
        wf.status = WorkflowStatus::Stuck;
        Some(WorkflowEvent::Stuck {
            workflow_id: wf.id.clone(),
            session_id: wf.session_id.clone(),
            step: step.to_string(),
            elapsed_secs: elapsed.as_secs(),
            timeout_secs: timeout.as_secs(),
        })
    }

    fn announce_stuck(&self, event: &WorkflowEvent) {
        if let WorkflowEvent::Stuck {
            workflow_id,
            step,
            elapsed_secs,
            ..
        } = event
        {
            warn!(workflow = %workflow_id, step = %step, elapsed_secs, "workflow stuck");
        }
        self.publish(event);
    }

    /// Stuck iff `elapsed` strictly exceeds the step's timeout. Completed
    /// workflows are never stuck.
    pub fn check_stuck(
        &self,
        id: &WorkflowId,
        current_step: &str,
        elapsed: Duration,
    ) -> Result<Option<WorkflowEvent>, WorkflowError> {
        let handle = self.handle(id)?;
        let event = self.mark_stuck(&mut handle.lock().unwrap(), current_step, elapsed);
        if let Some(event) = &event {
            self.announce_stuck(event);
        }
        Ok(event)
    }

    /// Check every workflow that is still making progress against the
    /// timeout of its first pending step. Workflows already marked stuck are
    /// not re-reported until they progress again. Each workflow is read and
    /// marked under one lock so a completion cannot land in between.
    pub fn sweep_stuck(&self, now: Instant) -> Vec<WorkflowEvent> {
        let mut events = Vec::new();
        for handle in self.handles() {
            let mut wf = handle.lock().unwrap();
            if wf.status == WorkflowStatus::Stuck {
                continue;
            }
            let Some(step) = wf.current_step() else {
                continue;
            };
            let elapsed = wf.since_progress(now);
            if let Some(event) = self.mark_stuck(&mut wf, step, elapsed) {
                events.push(event);
            }
        }
        for event in &events {
            self.announce_stuck(event);
        }
        events
    }

    pub fn report_confusion_signal(
        &self,
        id: &WorkflowId,
        signal: &str,
    ) -> Result<WorkflowEvent, WorkflowError> {
        let handle = self.handle(id)?;
        let session_id = handle.lock().unwrap().session_id.clone();
        let category = ConfusionCategory::of(signal);
        let event = WorkflowEvent::Confusion {
            workflow_id: id.clone(),
            session_id,
            category,
            signal: signal.to_string(),
            suggested: category.suggested_intervention(),
        };
        info!(workflow = %id, category = ?category, "confusion signal");
        self.publish(&event);
        Ok(event)
    }

    pub fn record_intervention(&self, id: &WorkflowId) -> Result<(), WorkflowError> {
        let handle = self.handle(id)?;
        handle.lock().unwrap().interventions += 1;
        Ok(())
    }

    /// Feed one line of session output; completes any step of the session's
    /// unfinished workflows whose output pattern matches.
    pub fn observe_output(&self, session_id: &SessionId, line: &str) -> Vec<(WorkflowId, &'static str)> {
        let mut matched = Vec::new();
        for handle in self.handles() {
            let wf = handle.lock().unwrap();
            if wf.session_id.as_ref() != Some(session_id) || wf.status == WorkflowStatus::Completed {
                continue;
            }
            for step in wf.kind.steps_matching(line) {
                if !wf.is_step_complete(step) {
                    matched.push((wf.id.clone(), step));
                }
            }
        }
        matched.retain(|(id, step)| {
            self.complete_step(id, step, serde_json::json!({ "detected_from": line }))
                .unwrap_or(false)
        });
        matched
    }

    pub fn workflows_for_session(&self, session_id: &SessionId) -> Vec<WorkflowId> {
        let mut found: Vec<(u64, WorkflowId)> = self
            .handles()
            .iter()
            .filter_map(|h| {
                let wf = h.lock().unwrap();
                (wf.session_id.as_ref() == Some(session_id)).then(|| (wf.seq, wf.id.clone()))
            })
            .collect();
        found.sort();
        found.into_iter().map(|(_, id)| id).collect()
    }

    /// The most recently started unfinished workflow of a session.
    pub fn active_workflow_for_session(&self, session_id: &SessionId) -> Option<WorkflowId> {
        self.workflows_for_session(session_id)
            .into_iter()
            .rev()
            .find(|id| {
                self.get(id)
                    .is_some_and(|wf| wf.status != WorkflowStatus::Completed)
            })
    }

    pub fn get(&self, id: &WorkflowId) -> Option<Workflow> {
        self.handle(id).ok().map(|h| h.lock().unwrap().clone())
    }

    pub fn list(&self) -> Vec<Workflow> {
        let mut all: Vec<Workflow> = self
            .handles()
            .iter()
            .map(|h| h.lock().unwrap().clone())
            .collect();
        all.sort_by_key(|w| w.seq);
        all
    }

    pub fn stats(&self) -> WorkflowStats {
        let all = self.list();
        let count = |status| all.iter().filter(|w| w.status == status).count();
        let completed = count(WorkflowStatus::Completed);

        let mut failures: BTreeMap<(&'static str, String), (WorkflowKind, usize)> = BTreeMap::new();
        for wf in &all {
            for f in &wf.failures {
                failures
                    .entry((wf.kind.as_str(), f.step.clone()))
                    .or_insert((wf.kind, 0))
                    .1 += 1;
            }
        }
        let mut top_failures: Vec<FailurePoint> = failures
            .into_iter()
            .map(|((_, step), (kind, count))| FailurePoint { kind, step, count })
            .collect();
        // Stable sort keeps the (type, step) order among equal counts.
        top_failures.sort_by(|a, b| b.count.cmp(&a.count));
        top_failures.truncate(5);

        let interventions: u32 = all
            .iter()
            .filter(|w| w.status == WorkflowStatus::Completed)
            .map(|w| w.interventions)
            .sum();

        WorkflowStats {
            total: all.len(),
            active: count(WorkflowStatus::Active),
            stuck: count(WorkflowStatus::Stuck),
            failed: count(WorkflowStatus::Failed),
            completed,
            success_rate: if all.is_empty() {
                0.0
            } else {
                completed as f64 / all.len() as f64
            },
            top_failures,
            interventions_per_completed: if completed == 0 {
                0.0
            } else {
                f64::from(interventions) / completed as f64
            },
        }
    }
}
