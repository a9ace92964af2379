//! Process-wide publish/subscribe bus.
//!
//! Every component publishes tagged events here: the bridge for session
//! lifecycle and output, the tracker for workflow progress, the intervention
//! manager for ready responses and permission requests. Subscribers get a
//! plain `std::sync::mpsc` receiver and run on their own threads; a dropped
//! receiver is pruned on the next publish.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::bridge::SessionId;
use crate::intervention::InterventionKind;
use crate::workflow::{ConfusionCategory, FailureSeverity, WorkflowId, WorkflowKind};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Created {
        session_id: SessionId,
        process_id: Option<u32>,
        shell: String,
        working_dir: String,
    },
    Attached {
        session_id: SessionId,
    },
    Detached {
        session_id: SessionId,
    },
    /// A chunk of decoded subprocess output.
    Output {
        session_id: SessionId,
        data: String,
    },
    CommandIntercepted {
        session_id: SessionId,
        command: String,
    },
    /// A send to the attached transport failed and the binding was cleared.
    TransportDropped {
        session_id: SessionId,
    },
    Terminated {
        session_id: SessionId,
        exit_code: Option<u32>,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Started {
        workflow_id: WorkflowId,
        kind: WorkflowKind,
        session_id: Option<SessionId>,
    },
    StepCompleted {
        workflow_id: WorkflowId,
        step: String,
    },
    Completed {
        workflow_id: WorkflowId,
    },
    Stuck {
        workflow_id: WorkflowId,
        session_id: Option<SessionId>,
        step: String,
        elapsed_secs: u64,
        timeout_secs: u64,
    },
    Failure {
        workflow_id: WorkflowId,
        session_id: Option<SessionId>,
        step: String,
        error: String,
        severity: FailureSeverity,
        suggested: Option<InterventionKind>,
    },
    Confusion {
        workflow_id: WorkflowId,
        session_id: Option<SessionId>,
        category: ConfusionCategory,
        signal: String,
        suggested: InterventionKind,
    },
}

impl WorkflowEvent {
    /// The intervention this event asks for, if any.
    pub fn suggested_intervention(&self) -> Option<InterventionKind> {
        match self {
            WorkflowEvent::Stuck { .. } => Some(InterventionKind::WorkflowStuck),
            WorkflowEvent::Failure { suggested, .. } => *suggested,
            WorkflowEvent::Confusion { suggested, .. } => Some(*suggested),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InterventionEvent {
    InterventionReady {
        intervention_id: String,
        session_id: Option<SessionId>,
        kind: InterventionKind,
        text: String,
    },
    PermissionRequested {
        approval_id: String,
        session_id: Option<SessionId>,
        action: String,
        files: Vec<String>,
    },
    ApprovalResolved {
        approval_id: String,
        session_id: Option<SessionId>,
        approved: bool,
    },
}

/// Everything that travels on the bus.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum Event {
    Session(SessionEvent),
    Workflow(WorkflowEvent),
    Intervention(InterventionEvent),
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}
