pub mod chat;
pub mod config;
pub mod run;

use clap::{Parser, Subcommand};

use sb_domain::config::Config;

/// Switchboard: a multi-route LLM agent runtime.
#[derive(Debug, Parser)]
#[command(name = "switchboard", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the HTTP server (default when no subcommand is given).
    Serve,
    /// Send a single message on a route and print the response.
    Run {
        /// The message to send.
        message: String,
        /// Route to run on.
        #[arg(long, default_value = "cli:run")]
        route: String,
        /// Print every turn event as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// Interactive chat on a route.
    Chat {
        #[arg(long, default_value = "cli:chat")]
        route: String,
    },
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from `SB_CONFIG` (or `config.toml`).  A missing
/// file yields the defaults.  Returns the config and the path used.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let config_path = std::env::var("SB_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let config = load_config_from(&config_path)?;
    Ok((config, config_path))
}

fn load_config_from(path: &str) -> anyhow::Result<Config> {
    if !std::path::Path::new(path).exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("reading {path}: {e}"))?;
    toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {path}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let config = load_config_from("/definitely/not/here.toml").unwrap();
        assert_eq!(config.server.port, 3210);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[compaction]\ntoken_ceiling = 5000\n").unwrap();

        let config = load_config_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.compaction.token_ceiling, 5000);
        assert_eq!(config.tools.max_tool_loops, 25);
    }

    #[test]
    fn malformed_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();

        let err = load_config_from(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn cli_parses_run() {
        let cli = Cli::parse_from(["switchboard", "run", "hello", "--route", "x:1", "--json"]);
        match cli.command {
            Some(Command::Run { message, route, json }) => {
                assert_eq!(message, "hello");
                assert_eq!(route, "x:1");
                assert!(json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
