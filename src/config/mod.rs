//! Configuration for previewd
//!
//! A missing file means defaults. Whatever is loaded or saved goes through
//! [`validate`] first, so the server never starts with settings it cannot
//! route or build with.

pub mod schema;

pub use schema::Config;

use crate::error::{PreviewError, PreviewResult};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Upper bound for `proxy.retries`
const MAX_PROXY_RETRIES: u32 = 10;

/// Locates the config file and the state directories
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Use `path`, or `<config dir>/previewd/config.toml` when none is given
    pub fn locate(path: Option<PathBuf>) -> Self {
        let config_path = path.unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("previewd")
                .join("config.toml")
        });
        Self { config_path }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Root of everything previewd keeps between runs
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("previewd")
    }

    /// Parent of the bare source mirrors
    pub fn repos_dir() -> PathBuf {
        Self::state_dir().join("repos")
    }

    pub async fn ensure_state_dirs() -> PreviewResult<()> {
        let dir = Self::repos_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| PreviewError::io(format!("creating directory {}", dir.display()), e))
    }

    pub async fn load(&self) -> PreviewResult<Config> {
        let content = match fs::read_to_string(&self.config_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.config_path.display(), "No config file, using defaults");
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(PreviewError::io(
                    format!("reading config from {}", self.config_path.display()),
                    e,
                ))
            }
        };

        let config: Config = toml::from_str(&content).map_err(|e| self.invalid(e.to_string()))?;
        validate(&config).map_err(|reason| self.invalid(reason))?;
        Ok(config)
    }

    /// Write `config`, creating the directory if needed
    pub async fn save(&self, config: &Config) -> PreviewResult<()> {
        validate(config).map_err(|reason| self.invalid(reason))?;

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PreviewError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            PreviewError::io(format!("writing config to {}", self.config_path.display()), e)
        })?;

        info!(path = %self.config_path.display(), "Configuration saved");
        Ok(())
    }

    fn invalid(&self, reason: String) -> PreviewError {
        PreviewError::ConfigInvalid {
            path: self.config_path.clone(),
            reason,
        }
    }
}

/// Reject settings previewd cannot run with
pub fn validate(config: &Config) -> Result<(), String> {
    check_environments(config)?;

    config
        .server
        .listen
        .parse::<SocketAddr>()
        .map_err(|e| format!("server.listen {:?}: {}", config.server.listen, e))?;

    let build = &config.build;
    if build.max_concurrent_builds == 0 {
        return Err("build.max_concurrent_builds must be at least 1".to_string());
    }
    if build.exposed_port == 0 {
        return Err("build.exposed_port must not be 0".to_string());
    }
    if build.tag_prefix.is_empty() || build.tag_prefix.contains([':', '@']) {
        return Err(format!(
            "build.tag_prefix {:?} is not an image repository name",
            build.tag_prefix
        ));
    }

    for registry in &config.image_runner.allowed_registries {
        if registry.trim_end_matches('/').is_empty()
            || registry.contains("://")
            || registry.contains(['@', ' '])
        {
            return Err(format!(
                "image_runner.allowed_registries entry {:?} must look like registry.example.com/namespace",
                registry
            ));
        }
    }

    if config.proxy.retries > MAX_PROXY_RETRIES {
        return Err(format!(
            "proxy.retries is {}, at most {} is allowed",
            config.proxy.retries, MAX_PROXY_RETRIES
        ));
    }

    let timing = &config.timing;
    if timing.container_min_age_secs > timing.container_expiry_secs {
        return Err("timing.container_min_age_secs exceeds timing.container_expiry_secs".to_string());
    }

    Ok(())
}

/// Environment names become host label prefixes (`<env>-hash-<sha>`), so
/// they may not contain the `-` separator
fn check_environments(config: &Config) -> Result<(), String> {
    if config.environments.is_empty() {
        return Err("at least one [[environments]] entry is required".to_string());
    }

    let mut seen = HashSet::new();
    for environment in &config.environments {
        let name = environment.name.as_str();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if !valid {
            return Err(format!(
                "environment name {:?} may only use a-z and 0-9",
                name
            ));
        }
        if !seen.insert(name) {
            return Err(format!("environment {:?} is listed twice", name));
        }
    }
    Ok(())
}
