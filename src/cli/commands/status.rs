//! Status command - check the container runtime and git

use crate::config::{Config, ConfigManager};
use crate::error::PreviewResult;
use crate::orchestration::{create_runtime, ContainerRuntime};
use crate::source::GitCli;
use console::{style, Emoji};
use std::process::Stdio;
use tokio::process::Command;

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "[FAIL] ");
static WARN: Emoji<'_, '_> = Emoji("⚠ ", "[WARN] ");

/// Execute the status command
pub async fn execute(manager: &ConfigManager, config: &Config) -> PreviewResult<()> {
    println!("{}", style("previewd status").bold().cyan());

    let mut all_ok = true;
    all_ok &= check_runtime(config).await;
    all_ok &= check_git().await;
    check_config(manager, config);

    println!();
    if all_ok {
        println!("{}", style("All critical checks passed").green().bold());
    } else {
        println!(
            "{}",
            style("Some checks failed, see above for details").yellow().bold()
        );
    }
    Ok(())
}

async fn check_runtime(config: &Config) -> bool {
    println!();
    println!("{}", style("Container runtime:").bold());

    let binary = &config.runtime.binary;
    match create_runtime(config).is_available().await {
        Ok(true) => {
            let version = first_line_of(binary, &["--version"]).await;
            println!(
                "  {} {} - {}",
                CHECK,
                style(binary).green(),
                version.as_deref().unwrap_or("available")
            );
            true
        }
        Ok(false) => {
            println!(
                "  {} {} - Not reachable. Is the daemon running?",
                CROSS,
                style(binary).red()
            );
            false
        }
        Err(e) => {
            println!("  {} {} - {}", CROSS, style(binary).red(), e);
            false
        }
    }
}

async fn check_git() -> bool {
    println!();
    println!("{}", style("Source control:").bold());

    if GitCli::is_available().await {
        let version = first_line_of("git", &["--version"]).await;
        println!(
            "  {} {}",
            CHECK,
            style(version.as_deref().unwrap_or("git")).green()
        );
        true
    } else {
        println!("  {} {} - Install git", CROSS, style("git not found").red());
        false
    }
}

fn check_config(manager: &ConfigManager, config: &Config) {
    println!();
    println!("{}", style("Configuration:").bold());

    let path = manager.path();
    if path.exists() {
        println!("  {} {}", CHECK, path.display());
    } else {
        println!(
            "  {} {} not found, using defaults. Run: previewd config init",
            WARN,
            path.display()
        );
    }
    println!("  {} Project: {}", CHECK, config.repo.project);
    println!(
        "  {} Environments: {}",
        CHECK,
        config.environment_names().join(", ")
    );
    if config.image_runner.allowed_registries.is_empty() {
        println!(
            "  {} {} - ?image= requests will be rejected",
            WARN,
            style("No allowed registries").yellow()
        );
    }
}

async fn first_line_of(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|l| l.trim().to_string())
}
