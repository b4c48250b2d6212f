//! previewd - On-demand preview environments
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use previewd::cli::{commands, Cli, Commands};
use previewd::config::ConfigManager;
use previewd::error::PreviewResult;
use previewd::logging;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> PreviewResult<()> {
    let cli = Cli::parse();

    // The server installs its own subscriber with file output
    if !matches!(cli.command, Commands::Serve(_)) {
        logging::init_cli(cli.verbose);
    }

    let manager = ConfigManager::locate(cli.config.clone());
    let config = manager.load().await?;

    match cli.command {
        Commands::Serve(args) => commands::serve(args, config, cli.verbose).await,
        Commands::Status => commands::status(&manager, &config).await,
        Commands::Config(args) => commands::config(args, &manager, &config).await,
    }
}
