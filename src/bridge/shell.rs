//! Shell resolution and PTY spawning with retry and fallback.

use std::path::Path;
use std::time::Duration;

use portable_pty::{Child, CommandBuilder, MasterPty, PtyPair, PtySize, native_pty_system};
use tracing::{info, warn};

use crate::error::BridgeError;

/// A shell running inside a freshly allocated PTY.
pub struct SpawnedShell {
    pub master: Box<dyn MasterPty + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub shell: String,
}

/// The shell to try first: configured, then `$SHELL`, then the platform
/// default.
pub fn preferred_shell(configured: Option<&str>) -> String {
    if let Some(shell) = configured.filter(|s| !s.trim().is_empty()) {
        return shell.to_string();
    }
    if cfg!(windows) {
        return "powershell.exe".to_string();
    }
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

/// The minimal shell used when the preferred one cannot be spawned.
pub fn fallback_shell(configured: &str) -> String {
    if !configured.trim().is_empty() {
        return configured.to_string();
    }
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        "/bin/sh".to_string()
    }
}

fn shell_name(shell: &str) -> &str {
    Path::new(shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(shell)
}

/// Arguments that make a shell behave as a login shell.
pub fn login_args(shell: &str) -> &'static [&'static str] {
    match shell_name(shell) {
        "bash" | "zsh" | "fish" | "ksh" => &["-l"],
        _ => &[],
    }
}

fn pty_exhaustion_hint(error: &str) -> Option<&'static str> {
    if error.contains("forkpty") {
        Some("PTY limit reached; on macOS try: sudo sysctl -w kern.tty.ptmx_max=768")
    } else if error.contains("Resource temporarily unavailable") {
        Some("close some terminal sessions or restart the server")
    } else {
        None
    }
}

/// Allocate a PTY, retrying with exponential backoff (100ms · 2^attempt).
pub fn open_pty_with_retry(size: PtySize, attempts: u32) -> Result<PtyPair, BridgeError> {
    let attempts = attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        if attempt > 0 {
            std::thread::sleep(Duration::from_millis(100 * 2_u64.pow(attempt)));
        }
        match native_pty_system().openpty(size) {
            Ok(pair) => return Ok(pair),
            Err(e) => {
                last_error = e.to_string();
                match pty_exhaustion_hint(&last_error) {
                    Some(hint) => warn!(attempt = attempt + 1, error = %last_error, hint, "PTY allocation failed"),
                    None => warn!(attempt = attempt + 1, error = %last_error, "PTY allocation failed"),
                }
            }
        }
    }

    Err(BridgeError::Pty(format!(
        "failed to allocate PTY after {attempts} attempts: {last_error}"
    )))
}

/// Spawn the preferred shell, falling back to the minimal one.
pub fn spawn_shell(
    preferred: &str,
    fallback: &str,
    size: PtySize,
    working_dir: &Path,
    attempts: u32,
) -> Result<SpawnedShell, BridgeError> {
    if !working_dir.is_dir() {
        return Err(BridgeError::SessionCreate(format!(
            "working directory does not exist: {}",
            working_dir.display()
        )));
    }

    let mut candidates = vec![preferred.to_string()];
    if fallback != preferred {
        candidates.push(fallback.to_string());
    }

    let mut last_error = String::from("no shell candidates");
    for (i, shell) in candidates.iter().enumerate() {
        let pair = open_pty_with_retry(size, attempts)?;

        let mut cmd = CommandBuilder::new(shell);
        // Only the preferred shell runs as a login shell; the fallback is
        // spawned bare.
        if i == 0 {
            cmd.args(login_args(shell));
        }
        cmd.cwd(working_dir);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        match pair.slave.spawn_command(cmd) {
            Ok(child) => {
                drop(pair.slave);
                info!(shell = %shell, pid = ?child.process_id(), "spawned shell in PTY");
                return Ok(SpawnedShell {
                    master: pair.master,
                    child,
                    shell: shell.clone(),
                });
            }
            Err(e) => {
                last_error = e.to_string();
                warn!(shell = %shell, error = %last_error, "shell failed to spawn");
            }
        }
    }

    Err(BridgeError::SessionCreate(format!(
        "no shell could be spawned: {last_error}"
    )))
}
