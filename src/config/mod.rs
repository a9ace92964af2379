use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".vibe";

fn default_history_limit() -> usize {
    1000
}

fn default_max_sessions() -> usize {
    10
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}

fn default_spawn_retries() -> u32 {
    3
}

fn default_fallback_shell() -> String {
    String::new()
}

fn default_prompt() -> String {
    "$ ".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:3030".to_string()
}

fn default_refresh_ttl_secs() -> u64 {
    5 * 60
}

fn default_max_depth() -> usize {
    3
}

fn default_instruction_file() -> String {
    "CLAUDE.md".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_step_timeout_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_intervention_cooldown_secs() -> u64 {
    30
}

fn default_history_cap() -> usize {
    100
}

fn default_log_file() -> String {
    "logs/supervision.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Output chunks kept per session for replay on attach.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_spawn_retries")]
    pub spawn_retries: u32,
    /// Preferred shell. Unset means `$SHELL`.
    #[serde(default)]
    pub shell: Option<String>,
    /// Shell used when the preferred one fails. Empty means the platform
    /// minimal shell.
    #[serde(default = "default_fallback_shell")]
    pub fallback_shell: String,
    /// Printed after enhanced command output.
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            spawn_retries: default_spawn_retries(),
            shell: None,
            fallback_shell: default_fallback_shell(),
            prompt: default_prompt(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContextConfig {
    #[serde(default = "default_refresh_ttl_secs")]
    pub refresh_ttl_secs: u64,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Sidecar instruction file, relative to the project root.
    #[serde(default = "default_instruction_file")]
    pub instruction_file: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            refresh_ttl_secs: default_refresh_ttl_secs(),
            max_depth: default_max_depth(),
            instruction_file: default_instruction_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Step timeout for steps without an explicit entry.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Minimum gap between two injected interventions in one session.
    #[serde(default = "default_intervention_cooldown_secs")]
    pub intervention_cooldown_secs: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_step_timeout_secs: default_step_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            intervention_cooldown_secs: default_intervention_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterventionConfig {
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    /// Supervision log, relative to `.vibe/`.
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            history_cap: default_history_cap(),
            log_file: default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub supervision: SupervisionConfig,
    #[serde(default)]
    pub interventions: InterventionConfig,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.vibe/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Where the supervision log lives for a project rooted at `root`.
    pub fn log_path(&self, root: &Path) -> PathBuf {
        root.join(CONFIG_DIR).join(&self.interventions.log_file)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config as TOML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.bridge.history_limit, 1000);
        assert_eq!(config.bridge.max_sessions, 10);
        assert_eq!(config.bridge.idle_timeout_secs, 1800);
        assert_eq!(config.bridge.cleanup_interval_secs, 300);
        assert_eq!(config.bridge.spawn_retries, 3);
        assert!(config.bridge.shell.is_none());
        assert_eq!(config.bridge.prompt, "$ ");
        assert_eq!(config.server.bind, "127.0.0.1:3030");
        assert_eq!(config.context.refresh_ttl_secs, 300);
        assert_eq!(config.context.max_depth, 3);
        assert_eq!(config.context.instruction_file, "CLAUDE.md");
        assert!(config.supervision.enabled);
        assert_eq!(config.supervision.default_step_timeout_secs, 60);
        assert_eq!(config.interventions.history_cap, 100);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[bridge]
history_limit = 500
max_sessions = 4
idle_timeout_secs = 600
spawn_retries = 5
shell = "/bin/zsh"
fallback_shell = "/bin/dash"
prompt = "> "

[server]
bind = "0.0.0.0:8080"

[context]
refresh_ttl_secs = 60
max_depth = 2
instruction_file = "AGENTS.md"

[supervision]
enabled = false
default_step_timeout_secs = 90
sweep_interval_secs = 10
intervention_cooldown_secs = 5

[interventions]
history_cap = 50
log_file = "logs/custom.jsonl"
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.bridge.history_limit, 500);
        assert_eq!(config.bridge.max_sessions, 4);
        assert_eq!(config.bridge.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(config.bridge.fallback_shell, "/bin/dash");
        assert_eq!(config.bridge.prompt, "> ");
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.context.instruction_file, "AGENTS.md");
        assert!(!config.supervision.enabled);
        assert_eq!(config.supervision.default_step_timeout_secs, 90);
        assert_eq!(config.interventions.history_cap, 50);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[bridge]
max_sessions = 2
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.bridge.max_sessions, 2);
        assert_eq!(config.bridge.history_limit, 1000);
        assert_eq!(config.context.max_depth, 3);
        assert!(config.supervision.enabled);
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.bridge.max_sessions, 10);
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let vibe_dir = tmp.path().join(".vibe");
        fs::create_dir_all(&vibe_dir).unwrap();
        fs::write(
            vibe_dir.join("config.toml"),
            r#"
[server]
bind = "127.0.0.1:9999"
"#,
        )
        .unwrap();

        let nested = tmp.path().join("src").join("deep").join("nested");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.server.bind, "127.0.0.1:9999");
    }

    #[test]
    fn malformed_config_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let vibe_dir = tmp.path().join(".vibe");
        fs::create_dir_all(&vibe_dir).unwrap();
        fs::write(vibe_dir.join("config.toml"), "[bridge\nmax_sessions = ").unwrap();
        assert!(ProjectConfig::load(tmp.path()).is_err());
    }

    #[test]
    fn rendered_toml_parses_back() {
        let config = ProjectConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed: ProjectConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.bridge.max_sessions, config.bridge.max_sessions);
        assert_eq!(parsed.log_path(Path::new("/p")), PathBuf::from("/p/.vibe/logs/supervision.jsonl"));
    }
}
