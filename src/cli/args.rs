//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// previewd - On-demand preview environments
///
/// Builds a container image per commit, starts it on first request and
/// proxies traffic to it until it expires.
#[derive(Parser, Debug)]
#[command(name = "previewd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "PREVIEWD_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the preview server
    Serve(ServeArgs),

    /// Check the container runtime and git
    Status,

    /// Show configuration
    Config(ConfigArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to listen on, overrides `server.listen`
    #[arg(short, long, env = "PREVIEWD_LISTEN")]
    pub listen: Option<String>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,

    /// Print the configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_listen_override() {
        let cli = Cli::parse_from(["previewd", "serve", "--listen", "127.0.0.1:4000"]);
        match cli.command {
            Commands::Serve(args) => assert_eq!(args.listen.as_deref(), Some("127.0.0.1:4000")),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::parse_from(["previewd", "-vv", "status"]);
        assert_eq!(cli.verbose, 2);
    }
}
