//! Supervision loop.
//!
//! Subscribes to the event bus, splits each session's output into lines and
//! scans them for signals. Confusion and error signals go through the
//! workflow tracker when the session has an unfinished workflow, then to the
//! intervention manager; the resulting text is typed back into the session.
//! Permission prompts become approval requests, and a human's decision is
//! answered with `y` or `n`. A periodic sweep turns stalled workflows into
//! stuck interventions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bridge::{SessionBridge, SessionId};
use crate::config::SupervisionConfig;
use crate::events::{Event, InterventionEvent, SessionEvent, WorkflowEvent};
use crate::intervention::{InterventionKind, InterventionManager, InterventionRequest};
use crate::prompt::{LineAssembler, Signal, SignalKind, SignalPatterns, strip_ansi};
use crate::workflow::{ConfusionCategory, ErrorClass, WorkflowId, WorkflowTracker};

/// Global on/off plus per-session opt-outs. Shared with the `vibe supervise`
/// command.
#[derive(Debug)]
pub struct SupervisionToggles {
    global: AtomicBool,
    disabled: Mutex<HashSet<SessionId>>,
}

impl SupervisionToggles {
    pub fn new(enabled: bool) -> Self {
        Self {
            global: AtomicBool::new(enabled),
            disabled: Mutex::new(HashSet::new()),
        }
    }

    pub fn global(&self) -> bool {
        self.global.load(Ordering::Relaxed)
    }

    pub fn set_global(&self, enabled: bool) {
        self.global.store(enabled, Ordering::Relaxed);
    }

    pub fn set_session(&self, session: &SessionId, enabled: bool) {
        let mut disabled = self.disabled.lock().unwrap();
        if enabled {
            disabled.remove(session);
        } else {
            disabled.insert(session.clone());
        }
    }

    pub fn is_enabled_for(&self, session: &SessionId) -> bool {
        self.global() && !self.disabled.lock().unwrap().contains(session)
    }

    fn forget(&self, session: &SessionId) {
        self.disabled.lock().unwrap().remove(session);
    }
}

/// Signal detection pauses this long after text is typed into a session;
/// the echo and the shell's reaction to it arrive in that window.
const QUIET_AFTER_INJECT: Duration = Duration::from_secs(3);
/// Injected lines are recognised in output for this long.
const ECHO_MEMORY: Duration = Duration::from_secs(60);
/// Shorter injected lines are too common to match on.
const MIN_ECHO_LEN: usize = 8;
const MAX_ECHO_LINES: usize = 256;

#[derive(Default)]
struct SessionWatch {
    lines: LineAssembler,
    last_intervention: Option<Instant>,
    /// Permission prompt raised from an unterminated line.
    asked: Option<String>,
    injected: VecDeque<(String, Instant)>,
    quiet_until: Option<Instant>,
}

impl SessionWatch {
    fn remember_injection(&mut self, text: &str, now: Instant) {
        self.injected
            .retain(|(_, at)| now.saturating_duration_since(*at) < ECHO_MEMORY);
        for line in text.lines().map(str::trim).filter(|l| l.len() >= MIN_ECHO_LEN) {
            self.injected.push_back((line.to_string(), now));
        }
        while self.injected.len() > MAX_ECHO_LINES {
            self.injected.pop_front();
        }
        self.quiet_until = Some(now + QUIET_AFTER_INJECT);
    }

    /// Whether `line` is our own injected text coming back, whole or wrapped.
    fn is_echo(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }
        self.injected.iter().any(|(sent, _)| {
            line.contains(sent.as_str()) || (line.len() >= MIN_ECHO_LEN && sent.contains(line))
        })
    }

    fn is_quiet(&self, now: Instant) -> bool {
        self.quiet_until.is_some_and(|until| now < until)
    }
}

pub struct Supervisor {
    bridge: Arc<SessionBridge>,
    tracker: Arc<WorkflowTracker>,
    interventions: Arc<InterventionManager>,
    toggles: Arc<SupervisionToggles>,
    patterns: SignalPatterns,
    cooldown: Duration,
    sweep_interval: Duration,
    sessions: HashMap<SessionId, SessionWatch>,
}

impl Supervisor {
    pub fn new(
        config: &SupervisionConfig,
        bridge: Arc<SessionBridge>,
        tracker: Arc<WorkflowTracker>,
        interventions: Arc<InterventionManager>,
        toggles: Arc<SupervisionToggles>,
    ) -> Self {
        Self {
            bridge,
            tracker,
            interventions,
            toggles,
            patterns: SignalPatterns::agent_output(),
            cooldown: Duration::from_secs(config.intervention_cooldown_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            sessions: HashMap::new(),
        }
    }

    /// Run on a dedicated thread until every bus sender is gone.
    pub fn spawn(mut self, events: mpsc::Receiver<Event>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            info!(sweep_secs = self.sweep_interval.as_secs(), "supervisor started");
            let mut last_sweep = Instant::now();
            loop {
                match events.recv_timeout(self.sweep_interval) {
                    Ok(event) => self.handle(event),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if last_sweep.elapsed() >= self.sweep_interval {
                    self.sweep(Instant::now());
                    last_sweep = Instant::now();
                }
            }
            info!("supervisor stopped");
        })
    }

    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Session(SessionEvent::Output { session_id, data }) => {
                self.on_output(&session_id, &data)
            }
            Event::Session(SessionEvent::Terminated { session_id, .. }) => {
                self.sessions.remove(&session_id);
                self.toggles.forget(&session_id);
                self.interventions.abandon_session_approvals(&session_id);
            }
            Event::Intervention(InterventionEvent::ApprovalResolved {
                approval_id,
                session_id: Some(session_id),
                approved,
            }) => {
                let answer = if approved { "y\r" } else { "n\r" };
                match self.bridge.inject(&session_id, answer) {
                    Ok(()) => info!(session = %session_id, approval = %approval_id, approved, "approval answered"),
                    Err(e) => warn!(session = %session_id, approval = %approval_id, error = %e, "could not answer approval"),
                }
            }
            _ => {}
        }
    }

    fn on_output(&mut self, session: &SessionId, data: &str) {
        let watch = self.sessions.entry(session.clone()).or_default();
        let lines: Vec<String> = watch
            .lines
            .push(data)
            .into_iter()
            .filter(|line| !watch.is_echo(line))
            .collect();
        let pending = Some(strip_ansi(watch.lines.pending())).filter(|p| !watch.is_echo(p));
        let quiet = watch.is_quiet(Instant::now());

        for line in &lines {
            for (workflow, step) in self.tracker.observe_output(session, line) {
                debug!(session = %session, workflow = %workflow, step, "step detected in output");
            }
        }
        if !self.toggles.is_enabled_for(session) {
            return;
        }

        if quiet {
            if !lines.is_empty() {
                debug!(session = %session, lines = lines.len(), "output right after injection not scanned");
            }
        } else {
            for line in &lines {
                let Some(signal) = self.patterns.detect(line) else {
                    continue;
                };
                // The answered prompt comes back as a complete line once echoed.
                if signal.kind == SignalKind::Permission && self.take_asked(session, &signal.line) {
                    continue;
                }
                self.on_signal(session, signal);
            }
        }
        // Permission prompts usually wait on an unterminated line.
        if let Some(signal) = pending
            .and_then(|p| self.patterns.detect(&p))
            .filter(|s| s.kind == SignalKind::Permission)
        {
            if let Some(watch) = self.sessions.get_mut(session) {
                watch.asked = Some(signal.line.clone());
            }
            self.on_signal(session, signal);
        }
    }

    fn take_asked(&mut self, session: &SessionId, line: &str) -> bool {
        let Some(watch) = self.sessions.get_mut(session) else {
            return false;
        };
        let answered = watch.asked.as_deref().is_some_and(|p| line.starts_with(p));
        if answered {
            watch.asked = None;
        }
        answered
    }

    fn on_signal(&mut self, session: &SessionId, signal: Signal) {
        let workflow = self.tracker.active_workflow_for_session(session);
        debug!(session = %session, kind = ?signal.kind, matched = %signal.matched_text, "signal detected");

        match signal.kind {
            SignalKind::Permission => {
                let already_waiting = self
                    .interventions
                    .pending_approvals()
                    .iter()
                    .any(|p| p.session_id.as_ref() == Some(session));
                if already_waiting {
                    return;
                }
                let mut request = InterventionRequest::new(InterventionKind::PermissionRequired)
                    .session(session.clone())
                    .action(signal.line.clone(), Vec::new());
                if let Some(id) = &workflow {
                    request = request.workflow(id.clone());
                }
                self.interventions.process(request);
            }
            SignalKind::Confusion => {
                let kind = match &workflow {
                    Some(id) => self
                        .tracker
                        .report_confusion_signal(id, &signal.line)
                        .ok()
                        .and_then(|e| e.suggested_intervention()),
                    None => Some(ConfusionCategory::of(&signal.line).suggested_intervention()),
                };
                if let Some(kind) = kind {
                    self.intervene(session, workflow, kind, None, &signal.line);
                }
            }
            SignalKind::Error => {
                let (kind, step) = match &workflow {
                    Some(id) => {
                        let step = self
                            .tracker
                            .get(id)
                            .and_then(|wf| wf.current_step())
                            .unwrap_or("unknown");
                        let escalation = self
                            .tracker
                            .report_failure(
                                id,
                                step,
                                &signal.line,
                                serde_json::json!({ "source": "session_output" }),
                            )
                            .ok()
                            .flatten();
                        (
                            escalation.and_then(|e| e.suggested_intervention()),
                            Some(step.to_string()),
                        )
                    }
                    None => {
                        let class = ErrorClass::of(&signal.line);
                        (
                            class.is_recoverable().then(|| class.suggested_intervention()),
                            None,
                        )
                    }
                };
                if let Some(kind) = kind {
                    self.intervene(session, workflow, kind, step, &signal.line);
                }
            }
        }
    }

    fn intervene(
        &mut self,
        session: &SessionId,
        workflow: Option<WorkflowId>,
        kind: InterventionKind,
        step: Option<String>,
        signal: &str,
    ) {
        let watch = self.sessions.entry(session.clone()).or_default();
        if watch
            .last_intervention
            .is_some_and(|at| at.elapsed() < self.cooldown)
        {
            debug!(session = %session, kind = %kind, "intervention suppressed by cooldown");
            return;
        }
        watch.last_intervention = Some(Instant::now());

        let mut request = InterventionRequest::new(kind)
            .session(session.clone())
            .signal(signal);
        if let Some(step) = step {
            request = request.step(step);
        }
        if let Some(id) = &workflow {
            request = request.workflow(id.clone());
        }
        let response = self.interventions.process(request);

        if let Some(id) = &workflow {
            if let Err(e) = self.tracker.record_intervention(id) {
                debug!(workflow = %id, error = %e, "workflow gone before intervention was counted");
            }
        }
        if let Some(text) = response.inject_text() {
            match self.bridge.inject(session, &format!("{text}\r")) {
                Ok(()) => {
                    if let Some(watch) = self.sessions.get_mut(session) {
                        watch.remember_injection(text, Instant::now());
                    }
                    info!(session = %session, kind = %kind, "intervention injected");
                }
                Err(e) => warn!(session = %session, kind = %kind, error = %e, "intervention not delivered"),
            }
        }
    }

    /// Escalate workflows whose current step has outlived its timeout.
    pub fn sweep(&mut self, now: Instant) {
        for event in self.tracker.sweep_stuck(now) {
            let WorkflowEvent::Stuck {
                workflow_id,
                session_id: Some(session),
                step,
                ..
            } = event
            else {
                continue;
            };
            if !self.toggles.is_enabled_for(&session) {
                continue;
            }
            let signal = format!("no progress on {step}");
            self.intervene(
                &session,
                Some(workflow_id),
                InterventionKind::WorkflowStuck,
                Some(step),
                &signal,
            );
        }
    }
}
