use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "vibe",
    about = "Terminal session bridge that supervises coding agents",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP/WebSocket bridge and the supervisor
    Serve {
        /// Address to listen on (overrides [server] bind)
        #[arg(long)]
        bind: Option<String>,

        /// Project root to supervise (defaults to the current directory)
        #[arg(long)]
        project: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config {
        /// Emit JSON instead of TOML
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print the project context the supervisor would send for a scenario
    Context {
        /// Scenario name, e.g. requirements_missing or file_confusion
        #[arg(default_value = "general")]
        scenario: String,

        /// Project root (defaults to the current directory)
        #[arg(long)]
        project: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_accepts_overrides() {
        let cli = Cli::try_parse_from(["vibe", "-vv", "serve", "--bind", "0.0.0.0:9000"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Serve { bind, project } => {
                assert_eq!(bind.as_deref(), Some("0.0.0.0:9000"));
                assert!(project.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn context_defaults_to_general() {
        let cli = Cli::try_parse_from(["vibe", "context"]).unwrap();
        assert!(matches!(cli.command, Command::Context { ref scenario, .. } if scenario == "general"));
    }

    #[test]
    fn config_json_flag() {
        let cli = Cli::try_parse_from(["vibe", "config", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::Config { json: true }));
    }
}
