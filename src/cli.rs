//! Command-line interface for warden.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::constants::DEFAULT_CONFIG_FILE;

/// Verbosity accepted by `--log-level`: a level name, or a number from 0 (off) to 5 (trace).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

/// Levels in increasing verbosity; the index doubles as the numeric shorthand.
const LEVELS: [(LevelFilter, &str); 6] = [
    (LevelFilter::OFF, "off"),
    (LevelFilter::ERROR, "error"),
    (LevelFilter::WARN, "warn"),
    (LevelFilter::INFO, "info"),
    (LevelFilter::DEBUG, "debug"),
    (LevelFilter::TRACE, "trace"),
];

impl LogLevelArg {
    /// Directive handed to the tracing `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        LEVELS
            .iter()
            .find(|(level, _)| *level == self.0)
            .map_or("info", |(_, name)| *name)
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        if value.is_empty() {
            return Err("--log-level needs a value".into());
        }

        if let Ok(index) = value.parse::<usize>() {
            return LEVELS
                .get(index)
                .map(|(level, _)| LogLevelArg(*level))
                .ok_or_else(|| format!("log level {index} is out of range; use 0 (off) to 5 (trace)"));
        }

        let name = match value.as_str() {
            "err" => "error",
            "warning" => "warn",
            "information" => "info",
            other => other,
        };
        LEVELS
            .iter()
            .find(|(_, known)| *known == name)
            .map(|(level, _)| LogLevelArg(*level))
            .ok_or_else(|| format!("unknown log level '{value}'"))
    }
}

/// Command-line interface for warden.
#[derive(Parser, Debug)]
#[command(name = "warden", version, author)]
#[command(about = "A self-healing supervisor for local service stacks", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Path to the configuration file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: String,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for warden.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start services and keep supervising them until interrupted.
    Start {
        /// Comma-separated service ids (defaults to all configured services).
        services: Option<String>,

        /// Run the configured build step first.
        #[arg(long)]
        build: bool,

        /// Skip health checks; services count as up once spawned.
        #[arg(long, visible_alias = "skip-health")]
        fast: bool,
    },

    /// Stop the resident supervisor and every service it started.
    Stop {
        /// Kill immediately instead of terminating gracefully.
        #[arg(long)]
        force: bool,
    },

    /// Stop a resident supervisor, then start again in the foreground.
    Restart {
        /// Comma-separated service ids (defaults to all configured services).
        services: Option<String>,

        /// Run the configured build step first.
        #[arg(long)]
        build: bool,

        /// Skip health checks; services count as up once spawned.
        #[arg(long, visible_alias = "skip-health")]
        fast: bool,
    },
}

/// Splits a comma-separated id list; `None` or blank means all services.
pub fn service_ids(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_accepts_ids_and_flags() {
        let cli =
            Cli::try_parse_from(["warden", "start", "api,worker", "--build", "--fast"]).unwrap();
        match cli.command {
            Commands::Start {
                services,
                build,
                fast,
            } => {
                assert_eq!(service_ids(services.as_deref()), vec!["api", "worker"]);
                assert!(build);
                assert!(fast);
            }
            other => panic!("expected start command, got {other:?}"),
        }
        assert_eq!(cli.config, DEFAULT_CONFIG_FILE);
    }

    #[test]
    fn skip_health_is_an_alias_for_fast() {
        let cli = Cli::try_parse_from(["warden", "restart", "--skip-health"]).unwrap();
        assert!(matches!(cli.command, Commands::Restart { fast: true, .. }));
    }

    #[test]
    fn config_and_log_level_are_global() {
        let cli = Cli::try_parse_from([
            "warden",
            "stop",
            "--force",
            "--config",
            "stack.yaml",
            "--log-level",
            "4",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Stop { force: true }));
        assert_eq!(cli.config, "stack.yaml");
        assert_eq!(cli.log_level.map(|level| level.as_str()), Some("debug"));
    }

    #[test]
    fn log_level_accepts_names_aliases_and_numbers() {
        let parse = |value: &str| value.parse::<LogLevelArg>().map(|level| level.as_str());
        assert_eq!(parse(" Warning "), Ok("warn"));
        assert_eq!(parse("err"), Ok("error"));
        assert_eq!(parse("0"), Ok("off"));
        assert_eq!(parse("trace"), Ok("trace"));
        assert!(parse("6").unwrap_err().contains("out of range"));
        assert!(parse("loud").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(Cli::try_parse_from(["warden", "launch"]).is_err());
        assert!(Cli::try_parse_from(["warden", "stop", "--log-level", "9"]).is_err());
    }

    #[test]
    fn blank_ids_mean_all_services() {
        assert!(service_ids(None).is_empty());
        assert!(service_ids(Some(" , ")).is_empty());
        assert_eq!(service_ids(Some("ml, api")), vec!["ml", "api"]);
    }
}
