//! Serve command - run the preview server

use crate::cli::args::ServeArgs;
use crate::config::{Config, ConfigManager};
use crate::daemon::Orchestrator;
use crate::error::PreviewResult;
use crate::logging;
use crate::server;
use std::sync::Arc;
use tracing::info;

/// Execute the serve command
pub async fn execute(args: ServeArgs, config: Config, verbose: u8) -> PreviewResult<()> {
    let (_guard, recent) = logging::init_server(verbose, &config.logging)?;
    logging::install_panic_hook();
    ConfigManager::ensure_state_dirs().await?;

    let listen = args.listen.unwrap_or_else(|| config.server.listen.clone());
    info!(
        project = %config.repo.project,
        runtime = %config.runtime.binary,
        environments = ?config.environment_names(),
        "Starting previewd"
    );

    let orch = Arc::new(Orchestrator::from_config(config).with_recent_logs(recent));
    let background = orch.spawn_background();

    let result = server::serve(Arc::clone(&orch), &listen).await;

    for handle in background {
        handle.abort();
    }
    result
}
