//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// syncdeck - realtime state mirror and publish-worker supervisor
///
/// Mirrors server-authoritative dashboard state over WebSocket and drives
/// isolated publish workers over a correlated request/response protocol.
#[derive(Parser, Debug)]
#[command(name = "syncdeck")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to the server and mirror its state until interrupted
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "SYNCDECK_CONFIG")]
        config: Option<String>,

        /// Server WebSocket URL (overrides configuration)
        #[arg(long)]
        url: Option<String>,
    },

    /// Serve the worker protocol on stdin/stdout
    Worker,

    /// Run one publish through a supervised worker and print the receipt
    Publish {
        /// Path to configuration file
        #[arg(short, long, env = "SYNCDECK_CONFIG")]
        config: Option<String>,

        /// Publish payload as JSON
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Run the worker on an in-process task instead of a child process
        #[arg(long)]
        in_process: bool,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Write a commented default configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_with_url() {
        let cli = Cli::parse_from(["syncdeck", "run", "--url", "ws://localhost:9000/ws"]);
        match cli.command {
            Commands::Run { config, url } => {
                assert!(config.is_none());
                assert_eq!(url.as_deref(), Some("ws://localhost:9000/ws"));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_publish_defaults() {
        let cli = Cli::parse_from(["syncdeck", "publish"]);
        match cli.command {
            Commands::Publish { payload, in_process, .. } => {
                assert_eq!(payload, "{}");
                assert!(!in_process);
            }
            _ => panic!("Expected Publish command"),
        }
    }

    #[test]
    fn test_publish_with_payload() {
        let cli = Cli::parse_from([
            "syncdeck",
            "publish",
            "--in-process",
            "--payload",
            r#"{"rows": 2}"#,
        ]);
        match cli.command {
            Commands::Publish { payload, in_process, .. } => {
                assert_eq!(payload, r#"{"rows": 2}"#);
                assert!(in_process);
            }
            _ => panic!("Expected Publish command"),
        }
    }

    #[test]
    fn test_worker_command() {
        let cli = Cli::parse_from(["syncdeck", "worker"]);
        assert!(matches!(cli.command, Commands::Worker));
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["syncdeck", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["syncdeck", "config", "init", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
