//! Per-session state: bounded output history, the input line buffer and the
//! weak transport binding.
//!
//! All mutable state sits behind one lock so the reader thread and the input
//! path never interleave half-applied updates.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use portable_pty::{ChildKiller, MasterPty, PtySize};
use tracing::{debug, warn};

use super::SessionId;
use super::transport::{ServerMessage, Transport};
use crate::commands::CommandInterceptor;
use crate::error::{BridgeError, TransportClosed};

/// Control byte sent to the shell to discard a partially typed line.
const LINE_KILL: u8 = 0x15;

/// Sliding window of output chunks. Oldest chunks are evicted first.
#[derive(Debug, Clone)]
pub struct OutputHistory {
    chunks: VecDeque<String>,
    cap: usize,
}

impl OutputHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(cap.min(1024)),
            cap,
        }
    }

    /// Append a chunk, returning the evicted chunk if the window was full.
    pub fn push(&mut self, chunk: String) -> Option<String> {
        if self.cap == 0 {
            return Some(chunk);
        }
        let evicted = if self.chunks.len() >= self.cap {
            self.chunks.pop_front()
        } else {
            None
        };
        self.chunks.push_back(chunk);
        evicted
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> Vec<String> {
        self.chunks.iter().cloned().collect()
    }

    /// All buffered output joined in original order.
    pub fn concat(&self) -> String {
        self.chunks.iter().map(String::as_str).collect()
    }
}

/// How a single input byte affects the line buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputByte {
    Terminator,
    Erase,
    Printable,
    Control,
}

pub fn classify_input(byte: u8) -> InputByte {
    match byte {
        b'\r' | b'\n' => InputByte::Terminator,
        0x7f | 0x08 => InputByte::Erase,
        // 0x80.. covers UTF-8 lead and continuation bytes.
        0x20..=0x7e | 0x80..=0xff => InputByte::Printable,
        _ => InputByte::Control,
    }
}

/// Characters typed since the last line terminator.
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    /// Remove the last character (a whole UTF-8 sequence). No-op when empty.
    pub fn erase(&mut self) {
        while let Some(byte) = self.bytes.pop() {
            if byte & 0b1100_0000 != 0b1000_0000 {
                break;
            }
        }
    }

    pub fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.bytes).into_owned();
        self.bytes.clear();
        line
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// What happened to an output chunk after it was buffered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputDelivery {
    /// No transport attached; the chunk is only in history.
    Buffered,
    /// Sent to the attached transport.
    Forwarded,
    /// The transport failed and its binding was cleared.
    TransportDropped,
}

/// A line the interceptor consumed instead of forwarding.
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptedLine {
    pub line: String,
    pub output: String,
}

/// Handles to the subprocess side of a session.
pub struct SessionIo {
    pub writer: Box<dyn Write + Send>,
    pub master: Option<Box<dyn MasterPty + Send>>,
    pub killer: Option<Box<dyn ChildKiller + Send + Sync>>,
}

struct SessionState {
    history: OutputHistory,
    line: LineBuffer,
    /// Bytes of the current line were already written to the subprocess.
    line_carried: bool,
    transport: Option<Weak<dyn Transport>>,
    last_activity: Instant,
    size: PtySize,
}

pub struct Session {
    id: SessionId,
    created_at: Instant,
    state: Mutex<SessionState>,
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    terminated: AtomicBool,
}

impl Session {
    pub fn new(id: SessionId, io: SessionIo, size: PtySize, history_cap: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            state: Mutex::new(SessionState {
                history: OutputHistory::new(history_cap),
                line: LineBuffer::default(),
                line_carried: false,
                transport: None,
                last_activity: now,
                size,
            }),
            writer: Mutex::new(io.writer),
            master: Mutex::new(io.master),
            killer: Mutex::new(io.killer),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().unwrap().last_activity
    }

    pub fn size(&self) -> PtySize {
        self.state.lock().unwrap().size
    }

    pub fn history(&self) -> Vec<String> {
        self.state.lock().unwrap().history.chunks()
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().unwrap().history.len()
    }

    pub fn pending_line(&self) -> String {
        self.state.lock().unwrap().line.as_string()
    }

    pub fn is_attached(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .transport
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Buffer an output chunk and forward it to the attached transport.
    pub fn record_output(&self, chunk: &str) -> OutputDelivery {
        let mut state = self.state.lock().unwrap();
        state.last_activity = Instant::now();
        state.history.push(chunk.to_string());

        let Some(transport) = state.transport.as_ref().and_then(Weak::upgrade) else {
            state.transport = None;
            return OutputDelivery::Buffered;
        };
        match transport.send(ServerMessage::Output {
            data: chunk.to_string(),
        }) {
            Ok(()) => OutputDelivery::Forwarded,
            Err(TransportClosed) => {
                state.transport = None;
                OutputDelivery::TransportDropped
            }
        }
    }

    /// Replay buffered history as one payload, then bind the transport.
    ///
    /// Replay and binding happen under the state lock, so no chunk recorded
    /// concurrently is either missed or delivered twice.
    pub fn attach(&self, transport: &Arc<dyn Transport>) -> Result<(), TransportClosed> {
        let mut state = self.state.lock().unwrap();
        if !state.history.is_empty() {
            transport.send(ServerMessage::Output {
                data: state.history.concat(),
            })?;
        }
        state.transport = Some(Arc::downgrade(transport));
        Ok(())
    }

    /// Clear the transport binding. Returns true if one was bound.
    pub fn detach(&self) -> bool {
        self.state.lock().unwrap().transport.take().is_some()
    }

    /// Detach only if `transport` is still the bound one.
    pub fn release(&self, transport: &Arc<dyn Transport>) -> bool {
        let mut state = self.state.lock().unwrap();
        let bound = state
            .transport
            .as_ref()
            .is_some_and(|weak| Weak::ptr_eq(weak, &Arc::downgrade(transport)));
        if bound {
            state.transport = None;
        }
        bound
    }

    pub fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        self.state
            .lock()
            .unwrap()
            .transport
            .take()
            .and_then(|weak| weak.upgrade())
    }

    /// Forward input bytes to the subprocess, maintaining the line buffer and
    /// consulting the interceptor on every completed line.
    pub fn submit_input(
        &self,
        bytes: &[u8],
        interceptor: Option<&dyn CommandInterceptor>,
        prompt: &str,
    ) -> Result<Vec<InterceptedLine>, BridgeError> {
        let mut forward: Vec<u8> = Vec::with_capacity(bytes.len());
        let mut intercepted = Vec::new();
        let mut line_start = 0usize;

        let mut state = self.state.lock().unwrap();
        state.last_activity = Instant::now();

        for &byte in bytes {
            match classify_input(byte) {
                InputByte::Terminator => {
                    let line = state.line.take();
                    let carried = std::mem::replace(&mut state.line_carried, false);

                    let candidate = interceptor.filter(|i| !line.is_empty() && i.matches(&line));
                    let Some(interceptor) = candidate else {
                        forward.push(byte);
                        line_start = forward.len();
                        continue;
                    };

                    // The handler may take a while; never hold the state lock
                    // across it.
                    drop(state);
                    let handled = self.run_interceptor(interceptor, &line);
                    if let Some(output) = &handled {
                        self.record_output(&format_command_output(output, prompt));
                    }
                    state = self.state.lock().unwrap();

                    match handled {
                        Some(output) => {
                            forward.truncate(line_start);
                            if carried {
                                forward.push(LINE_KILL);
                            }
                            intercepted.push(InterceptedLine { line, output });
                        }
                        None => forward.push(byte),
                    }
                    line_start = forward.len();
                }
                InputByte::Erase => {
                    state.line.erase();
                    forward.push(byte);
                }
                InputByte::Printable => {
                    state.line.push(byte);
                    forward.push(byte);
                }
                InputByte::Control => forward.push(byte),
            }
        }

        state.line_carried = !state.line.is_empty();
        drop(state);

        if !forward.is_empty() {
            self.write_raw(&forward)?;
        }
        Ok(intercepted)
    }

    fn run_interceptor(&self, interceptor: &dyn CommandInterceptor, line: &str) -> Option<String> {
        match interceptor.execute(&self.id, line) {
            Ok(outcome) if outcome.handled => Some(outcome.output),
            Ok(_) => {
                debug!(session = %self.id, line, "enhanced command not handled; forwarding");
                None
            }
            Err(e) => {
                warn!(session = %self.id, line, error = %e, "enhanced command failed; forwarding");
                None
            }
        }
    }

    /// Write bytes straight to the subprocess input.
    pub fn write_raw(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    pub fn touch(&self) {
        self.state.lock().unwrap().last_activity = Instant::now();
    }

    pub fn resize(&self, size: PtySize) -> Result<(), BridgeError> {
        if let Some(master) = self.master.lock().unwrap().as_ref() {
            master
                .resize(size)
                .map_err(|e| BridgeError::Pty(e.to_string()))?;
        }
        let mut state = self.state.lock().unwrap();
        state.size = size;
        state.last_activity = Instant::now();
        Ok(())
    }

    /// Flip the session to terminated. Returns true only for the first caller.
    pub fn mark_terminated(&self) -> bool {
        !self.terminated.swap(true, Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn kill(&self) {
        if let Some(killer) = self.killer.lock().unwrap().as_mut() {
            if let Err(e) = killer.kill() {
                debug!(session = %self.id, error = %e, "kill failed (process likely exited)");
            }
        }
    }
}

/// Render an enhanced command result the way a shell would: on its own
/// lines, followed by a fresh prompt.
pub fn format_command_output(output: &str, prompt: &str) -> String {
    let body = output.trim_end_matches('\n').replace('\n', "\r\n");
    if body.is_empty() {
        format!("\r\n{prompt}")
    } else {
        format!("\r\n{body}\r\n{prompt}")
    }
}
