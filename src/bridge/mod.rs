//! Terminal session bridge.
//!
//! Owns one PTY-backed shell per session, buffers its output in a bounded
//! history, relays bytes to and from an attached transport, and intercepts
//! enhanced commands typed into the session.
//!
//! ## Session lifecycle
//!
//! ```text
//! Created    → shell spawned, output buffering starts immediately
//! Attached   → transport bound, buffered history replayed once
//! Detached   → transport gone, shell keeps running, output keeps buffering
//! Terminated → shell exited or terminate() called, session removed
//! ```
//!
//! Each session has a dedicated reader thread. Output is pushed into the
//! session under its lock and published on the event bus; sends to the
//! transport never block.

pub mod session;
pub mod shell;
pub mod transport;

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{Child, PtySize};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::commands::CommandInterceptor;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::events::{Event, EventBus, SessionEvent};

use session::{InterceptedLine, OutputDelivery, Session, SessionIo};
use transport::{ServerMessage, Transport};

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What session creation reports back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub process_id: Option<u32>,
    pub shell: String,
    pub working_dir: PathBuf,
}

/// Per-session entry in [`BridgeStats`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub age_seconds: u64,
    pub idle_seconds: u64,
    pub attached: bool,
    pub buffered_chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub sessions: Vec<SessionSummary>,
    pub platform: &'static str,
    pub shell: String,
}

/// Concurrent id → session map. Lookups share the lock; insert and remove
/// take it exclusively.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn insert(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .unwrap()
            .insert(session.id().clone(), session);
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.write().unwrap().remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }
}

pub struct SessionBridge {
    registry: SessionRegistry,
    config: BridgeConfig,
    events: EventBus,
    interceptor: RwLock<Option<Arc<dyn CommandInterceptor>>>,
}

impl SessionBridge {
    pub fn new(config: BridgeConfig, events: EventBus) -> Self {
        Self {
            registry: SessionRegistry::default(),
            config,
            events,
            interceptor: RwLock::new(None),
        }
    }

    pub fn set_interceptor(&self, interceptor: Arc<dyn CommandInterceptor>) {
        *self.interceptor.write().unwrap() = Some(interceptor);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.registry.all().iter().map(|s| s.id().clone()).collect();
        ids.sort();
        ids
    }

    fn session(&self, id: &SessionId) -> Result<Arc<Session>, BridgeError> {
        self.registry
            .get(id)
            .ok_or_else(|| BridgeError::SessionNotFound(id.clone()))
    }

    /// Spawn a shell in a new PTY and register it.
    pub fn create_session(
        &self,
        cols: u16,
        rows: u16,
        working_dir: &Path,
    ) -> Result<SessionInfo, BridgeError> {
        if self.registry.len() >= self.config.max_sessions {
            let reaped = self.cleanup_idle(Duration::from_secs(self.config.idle_timeout_secs));
            if !reaped.is_empty() {
                info!(count = reaped.len(), "reaped idle sessions to make room");
            }
            let active = self.registry.len();
            if active >= self.config.max_sessions {
                return Err(BridgeError::SessionLimit(active));
            }
        }

        let size = PtySize {
            rows: rows.max(1),
            cols: cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        };
        let preferred = shell::preferred_shell(self.config.shell.as_deref());
        let fallback = shell::fallback_shell(&self.config.fallback_shell);
        let spawned = shell::spawn_shell(
            &preferred,
            &fallback,
            size,
            working_dir,
            self.config.spawn_retries,
        )?;

        let reader = spawned
            .master
            .try_clone_reader()
            .map_err(|e| BridgeError::SessionCreate(format!("failed to clone PTY reader: {e}")))?;
        let writer = spawned
            .master
            .take_writer()
            .map_err(|e| BridgeError::SessionCreate(format!("failed to take PTY writer: {e}")))?;
        let process_id = spawned.child.process_id();
        let killer = spawned.child.clone_killer();

        let id = SessionId::generate();
        let session = Arc::new(Session::new(
            id.clone(),
            SessionIo {
                writer,
                master: Some(spawned.master),
                killer: Some(killer),
            },
            size,
            self.config.history_limit,
        ));
        self.registry.insert(session.clone());

        let info = SessionInfo {
            session_id: id.clone(),
            process_id,
            shell: spawned.shell,
            working_dir: working_dir.to_path_buf(),
        };
        self.events.publish(Event::Session(SessionEvent::Created {
            session_id: id.clone(),
            process_id,
            shell: info.shell.clone(),
            working_dir: working_dir.display().to_string(),
        }));

        let registry = self.registry.clone();
        let events = self.events.clone();
        let child = spawned.child;
        let pump = thread::Builder::new()
            .name(format!("pty-reader-{id}"))
            .spawn(move || pump_output(session, reader, child, registry, events));
        if let Err(e) = pump {
            self.terminate(&id);
            return Err(BridgeError::SessionCreate(format!(
                "failed to start reader thread: {e}"
            )));
        }

        info!(
            session = %id,
            shell = %info.shell,
            pid = ?process_id,
            active = self.registry.len(),
            "session created"
        );
        Ok(info)
    }

    /// Bind a transport and replay the buffered history to it.
    pub fn attach(&self, id: &SessionId, transport: &Arc<dyn Transport>) -> Result<(), BridgeError> {
        let session = self.session(id)?;
        match session.attach(transport) {
            Ok(()) => {
                debug!(session = %id, "transport attached");
                self.events.publish(Event::Session(SessionEvent::Attached {
                    session_id: id.clone(),
                }));
            }
            Err(e) => warn!(session = %id, error = %e, "history replay failed; transport not bound"),
        }
        Ok(())
    }

    /// Forward input, intercepting enhanced commands on completed lines.
    pub fn submit_input(&self, id: &SessionId, bytes: &[u8]) -> Result<(), BridgeError> {
        let session = self.session(id)?;
        let interceptor = self.interceptor.read().unwrap().clone();
        let intercepted = session.submit_input(bytes, interceptor.as_deref(), &self.config.prompt)?;
        for InterceptedLine { line, .. } in intercepted {
            info!(session = %id, command = %line, "enhanced command intercepted");
            self.events
                .publish(Event::Session(SessionEvent::CommandIntercepted {
                    session_id: id.clone(),
                    command: line,
                }));
        }
        Ok(())
    }

    /// Write supervisor text straight into the shell, bypassing interception.
    pub fn inject(&self, id: &SessionId, text: &str) -> Result<(), BridgeError> {
        let session = self.session(id)?;
        session.write_raw(text.as_bytes())?;
        session.touch();
        debug!(session = %id, bytes = text.len(), "injected input");
        Ok(())
    }

    pub fn detach(&self, id: &SessionId) -> Result<(), BridgeError> {
        let session = self.session(id)?;
        if session.detach() {
            self.events.publish(Event::Session(SessionEvent::Detached {
                session_id: id.clone(),
            }));
        }
        Ok(())
    }

    /// Detach `transport` if it is still the one bound to the session.
    pub fn release(&self, id: &SessionId, transport: &Arc<dyn Transport>) -> bool {
        let Some(session) = self.registry.get(id) else {
            return false;
        };
        let released = session.release(transport);
        if released {
            self.events.publish(Event::Session(SessionEvent::Detached {
                session_id: id.clone(),
            }));
        }
        released
    }

    pub fn resize(&self, id: &SessionId, cols: u16, rows: u16) -> Result<(), BridgeError> {
        let session = self.session(id)?;
        session.resize(PtySize {
            rows: rows.max(1),
            cols: cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        })
    }

    pub fn history(&self, id: &SessionId) -> Result<Vec<String>, BridgeError> {
        Ok(self.session(id)?.history())
    }

    /// Kill the shell, close the transport and forget the session.
    /// Returns false if the session was already gone.
    pub fn terminate(&self, id: &SessionId) -> bool {
        let Some(session) = self.registry.remove(id) else {
            return false;
        };
        if session.mark_terminated() {
            session.kill();
            if let Some(transport) = session.take_transport() {
                transport.close();
            }
            self.events.publish(Event::Session(SessionEvent::Terminated {
                session_id: id.clone(),
                exit_code: None,
            }));
            info!(session = %id, active = self.registry.len(), "session terminated");
        }
        true
    }

    pub fn terminate_all(&self) {
        for id in self.session_ids() {
            self.terminate(&id);
        }
    }

    /// Terminate sessions without input or output for longer than `idle`.
    pub fn cleanup_idle(&self, idle: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let idle_ids: Vec<SessionId> = self
            .registry
            .all()
            .iter()
            .filter(|s| now.duration_since(s.last_activity()) > idle)
            .map(|s| s.id().clone())
            .collect();
        for id in &idle_ids {
            info!(session = %id, "cleaning up idle session");
            self.terminate(id);
        }
        idle_ids
    }

    pub fn stats(&self) -> BridgeStats {
        let now = Instant::now();
        let mut sessions: Vec<SessionSummary> = self
            .registry
            .all()
            .iter()
            .map(|s| SessionSummary {
                id: s.id().clone(),
                age_seconds: now.duration_since(s.created_at()).as_secs(),
                idle_seconds: now.duration_since(s.last_activity()).as_secs(),
                attached: s.is_attached(),
                buffered_chunks: s.history_len(),
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        BridgeStats {
            active_sessions: sessions.len(),
            max_sessions: self.config.max_sessions,
            sessions,
            platform: std::env::consts::OS,
            shell: shell::preferred_shell(self.config.shell.as_deref()),
        }
    }
}

/// Decode as much of `carry` as forms complete UTF-8, keeping an incomplete
/// trailing sequence for the next read.
fn drain_utf8(carry: &mut Vec<u8>) -> String {
    match std::str::from_utf8(carry) {
        Ok(text) => {
            let out = text.to_string();
            carry.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let out = String::from_utf8_lossy(&carry[..valid]).into_owned();
            carry.drain(..valid);
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            out
        }
    }
}

/// Reader loop: runs until the PTY reports EOF, then reaps the child and
/// retires the session.
fn pump_output(
    session: Arc<Session>,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    registry: SessionRegistry,
    events: EventBus,
) {
    let id = session.id().clone();
    let mut buf = [0u8; 4096];
    let mut carry: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(session = %id, "PTY read error (process likely exited): {e}");
                break;
            }
        };
        carry.extend_from_slice(&buf[..n]);
        let text = drain_utf8(&mut carry);
        if text.is_empty() {
            continue;
        }
        publish_output(&session, &events, text);
    }
    if !carry.is_empty() {
        let text = String::from_utf8_lossy(&carry).into_owned();
        publish_output(&session, &events, text);
    }

    let exit_code = match child.wait() {
        Ok(status) => Some(status.exit_code()),
        Err(e) => {
            warn!(session = %id, error = %e, "failed to wait for shell");
            None
        }
    };

    if session.mark_terminated() {
        if let Some(transport) = session.take_transport() {
            let _ = transport.send(ServerMessage::Exit { code: exit_code });
            transport.close();
        }
        registry.remove(&id);
        events.publish(Event::Session(SessionEvent::Terminated {
            session_id: id.clone(),
            exit_code,
        }));
        info!(session = %id, exit_code = ?exit_code, "shell exited");
    }
}

fn publish_output(session: &Session, events: &EventBus, text: String) {
    if session.record_output(&text) == OutputDelivery::TransportDropped {
        warn!(session = %session.id(), "transport send failed; binding cleared");
        events.publish(Event::Session(SessionEvent::TransportDropped {
            session_id: session.id().clone(),
        }));
    }
    events.publish(Event::Session(SessionEvent::Output {
        session_id: session.id().clone(),
        data: text,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::testing::RecordingTransport;
    use crate::commands::CommandOutcome;
    use std::sync::mpsc;

    fn sh_config() -> BridgeConfig {
        BridgeConfig {
            shell: Some("/bin/sh".to_string()),
            ..BridgeConfig::default()
        }
    }

    fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    struct StatusCommand;

    impl CommandInterceptor for StatusCommand {
        fn matches(&self, line: &str) -> bool {
            line.starts_with("vibe")
        }

        fn execute(&self, _id: &SessionId, _line: &str) -> anyhow::Result<CommandOutcome> {
            Ok(CommandOutcome::handled("supervision: on"))
        }
    }

    #[test]
    fn session_id_display_and_serde() {
        let id = SessionId::from("abc");
        assert_eq!(id.to_string(), "abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""abc""#);
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn drain_utf8_carries_split_sequence() {
        let bytes = "é".as_bytes();
        let mut carry = vec![b'a', bytes[0]];
        assert_eq!(drain_utf8(&mut carry), "a");
        assert_eq!(carry, vec![bytes[0]]);
        carry.push(bytes[1]);
        assert_eq!(drain_utf8(&mut carry), "é");
        assert!(carry.is_empty());
    }

    #[test]
    fn unknown_session_is_not_found() {
        let bridge = SessionBridge::new(sh_config(), EventBus::new());
        let id = SessionId::from("missing");
        let transport: Arc<dyn Transport> = Arc::new(RecordingTransport::default());
        assert!(matches!(
            bridge.attach(&id, &transport),
            Err(BridgeError::SessionNotFound(_))
        ));
        assert!(matches!(
            bridge.submit_input(&id, b"ls\r"),
            Err(BridgeError::SessionNotFound(_))
        ));
        assert!(matches!(bridge.detach(&id), Err(BridgeError::SessionNotFound(_))));
        assert!(!bridge.terminate(&id));
    }

    #[cfg(unix)]
    #[test]
    fn echo_round_trip_on_tiny_pty() {
        let bridge = SessionBridge::new(sh_config(), EventBus::new());
        let info = bridge.create_session(1, 1, Path::new("/tmp")).unwrap();
        assert_eq!(info.shell, "/bin/sh");

        let recorder = Arc::new(RecordingTransport::default());
        let transport: Arc<dyn Transport> = recorder.clone();
        bridge.attach(&info.session_id, &transport).unwrap();
        bridge.submit_input(&info.session_id, b"echo hi\r").unwrap();

        assert!(
            wait_for(|| recorder.output().contains("hi")),
            "expected output containing hi, got: {:?}",
            recorder.output()
        );
        assert!(bridge.terminate(&info.session_id));
    }

    #[cfg(unix)]
    #[test]
    fn output_buffers_before_attach_and_replays() {
        let bridge = SessionBridge::new(sh_config(), EventBus::new());
        let info = bridge.create_session(80, 24, Path::new("/tmp")).unwrap();
        bridge
            .submit_input(&info.session_id, b"echo buffered-marker\r")
            .unwrap();
        assert!(wait_for(|| {
            bridge
                .history(&info.session_id)
                .map(|h| h.concat().matches("buffered-marker").count() >= 2)
                .unwrap_or(false)
        }));

        let recorder = Arc::new(RecordingTransport::default());
        let transport: Arc<dyn Transport> = recorder.clone();
        bridge.attach(&info.session_id, &transport).unwrap();
        let frames = recorder.frames();
        assert_eq!(frames.len(), 1, "history must arrive as one payload");
        assert!(recorder.output().contains("buffered-marker"));
        bridge.terminate(&info.session_id);
    }

    #[cfg(unix)]
    #[test]
    fn intercepted_command_answers_on_output_stream() {
        let bridge = SessionBridge::new(sh_config(), EventBus::new());
        bridge.set_interceptor(Arc::new(StatusCommand));
        let info = bridge.create_session(80, 24, Path::new("/tmp")).unwrap();

        let recorder = Arc::new(RecordingTransport::default());
        let transport: Arc<dyn Transport> = recorder.clone();
        bridge.attach(&info.session_id, &transport).unwrap();
        bridge.submit_input(&info.session_id, b"vibe status\r").unwrap();

        assert!(wait_for(|| recorder.output().contains("supervision: on")));
        bridge.terminate(&info.session_id);
    }

    #[cfg(unix)]
    #[test]
    fn shell_exit_removes_session_and_closes_transport() {
        let bridge = SessionBridge::new(sh_config(), EventBus::new());
        let rx: mpsc::Receiver<Event> = bridge.events().subscribe();
        let info = bridge.create_session(80, 24, Path::new("/tmp")).unwrap();

        let recorder = Arc::new(RecordingTransport::default());
        let transport: Arc<dyn Transport> = recorder.clone();
        bridge.attach(&info.session_id, &transport).unwrap();
        bridge.submit_input(&info.session_id, b"exit 0\r").unwrap();

        assert!(wait_for(|| bridge.registry().get(&info.session_id).is_none()));
        assert!(recorder.is_closed());
        assert!(
            recorder
                .frames()
                .iter()
                .any(|f| matches!(f, ServerMessage::Exit { .. }))
        );

        let terminated = rx.try_iter().any(|e| {
            matches!(e, Event::Session(SessionEvent::Terminated { ref session_id, .. }) if *session_id == info.session_id)
        });
        assert!(terminated);
    }

    #[cfg(unix)]
    #[test]
    fn terminate_is_idempotent() {
        let bridge = SessionBridge::new(sh_config(), EventBus::new());
        let info = bridge.create_session(80, 24, Path::new("/tmp")).unwrap();
        let recorder = Arc::new(RecordingTransport::default());
        let transport: Arc<dyn Transport> = recorder.clone();
        bridge.attach(&info.session_id, &transport).unwrap();

        assert!(bridge.terminate(&info.session_id));
        assert!(recorder.is_closed());
        assert!(!bridge.terminate(&info.session_id));
        assert!(bridge.registry().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn session_limit_enforced() {
        let config = BridgeConfig {
            max_sessions: 1,
            ..sh_config()
        };
        let bridge = SessionBridge::new(config, EventBus::new());
        let first = bridge.create_session(80, 24, Path::new("/tmp")).unwrap();
        let second = bridge.create_session(80, 24, Path::new("/tmp"));
        assert!(matches!(second, Err(BridgeError::SessionLimit(1))));
        bridge.terminate(&first.session_id);
    }

    #[cfg(unix)]
    #[test]
    fn cleanup_idle_reaps_quiet_sessions() {
        let bridge = SessionBridge::new(sh_config(), EventBus::new());
        let info = bridge.create_session(80, 24, Path::new("/tmp")).unwrap();
        thread::sleep(Duration::from_millis(50));
        let reaped = bridge.cleanup_idle(Duration::ZERO);
        assert_eq!(reaped, vec![info.session_id.clone()]);
        assert!(bridge.registry().get(&info.session_id).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn stats_report_sessions() {
        let bridge = SessionBridge::new(sh_config(), EventBus::new());
        let info = bridge.create_session(80, 24, Path::new("/tmp")).unwrap();
        let stats = bridge.stats();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.max_sessions, BridgeConfig::default().max_sessions);
        assert_eq!(stats.sessions[0].id, info.session_id);
        assert!(!stats.sessions[0].attached);
        bridge.resize(&info.session_id, 120, 40).unwrap();
        bridge.terminate(&info.session_id);
    }
}
