use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use vibe_supervisor::cli::{Cli, Command};
use vibe_supervisor::config::{CONFIG_DIR, ProjectConfig};
use vibe_supervisor::context::{ContextCache, Scenario};
use vibe_supervisor::events::EventBus;
use vibe_supervisor::server::{self, AppState};

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| format!("(defaults; no {CONFIG_DIR}/config.toml found)"))
}

fn resolve_root(project: Option<PathBuf>, cwd: &Path) -> Result<PathBuf> {
    let root = project.unwrap_or_else(|| cwd.to_path_buf());
    root.canonicalize()
        .with_context(|| format!("project directory not found: {}", root.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet = matches!(&cli.command, Command::Config { .. } | Command::Context { .. });

    let filter = match cli.verbose {
        0 if quiet => "vibe_supervisor=warn",
        0 => "vibe_supervisor=info",
        1 => "vibe_supervisor=debug",
        _ => "vibe_supervisor=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;

    match cli.command {
        Command::Serve { bind, project } => {
            let root = resolve_root(project, &cwd)?;
            let (config, config_path) = ProjectConfig::load(&root)?;
            info!(root = %root.display(), config = %config_source_label(config_path.as_deref()), "starting");

            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let addr: SocketAddr = bind
                .parse()
                .with_context(|| format!("invalid bind address: {bind}"))?;

            let state = Arc::new(AppState::new(&config, &root, EventBus::new()));
            server::start_background(&config, &state)?;
            server::serve(
                addr,
                state,
                Duration::from_secs(config.bridge.cleanup_interval_secs.max(1)),
                Duration::from_secs(config.bridge.idle_timeout_secs),
            )
            .await?;
        }
        Command::Config { json } => {
            let (config, config_path) = ProjectConfig::load(&cwd)?;
            let source = config_source_label(config_path.as_deref());
            if json {
                let payload = serde_json::json!({
                    "config": config,
                    "source_path": source,
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")?
                );
            } else {
                println!("# source: {source}");
                print!("{}", config.to_toml()?);
            }
        }
        Command::Context { scenario, project } => {
            let root = resolve_root(project, &cwd)?;
            let (config, _) = ProjectConfig::load(&root)?;
            let cache = ContextCache::new(&root, config.context);
            let rendered = cache.get_context_for(Scenario::parse_lenient(&scenario), None);
            println!("{}", rendered.text);
        }
    }

    Ok(())
}
