use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// FleetLink: one hub for a fleet of game servers.
#[derive(Parser, Debug)]
#[command(name = "fleetlink", version, about)]
pub struct Cli {
    /// Path to config file (default: ~/.fleetlink/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the listen address from the config.
    #[arg(long, global = true)]
    pub listen: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the hub in the foreground (default).
    Run,
    /// Validate the config file and print any problems.
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_to_run() {
        let cli = Cli::parse_from(["fleetlink"]);
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_check_config_with_path() {
        let cli = Cli::parse_from(["fleetlink", "check-config", "--config", "/etc/fleetlink.toml"]);
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/fleetlink.toml")));
    }

    #[test]
    fn test_parse_listen_override() {
        let cli = Cli::parse_from(["fleetlink", "--listen", "0.0.0.0:9000", "run"]);
        assert!(matches!(cli.command, Some(Commands::Run)));
        assert_eq!(cli.listen.as_deref(), Some("0.0.0.0:9000"));
    }
}
