//! Configuration schema for previewd
//!
//! Configuration is stored at `~/.config/previewd/config.toml`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener settings
    pub server: ServerConfig,

    /// Process log settings
    pub logging: LoggingConfig,

    /// Container runtime settings
    pub runtime: RuntimeConfig,

    /// Tracked source repository
    pub repo: RepoConfig,

    /// Image build settings
    pub build: BuildConfig,

    /// Supported environments, the first one is the default
    pub environments: Vec<EnvironmentConfig>,

    /// Container start/stop settings
    pub lifecycle: LifecycleConfig,

    /// Registry image runner policy
    pub image_runner: ImageRunnerConfig,

    /// Reverse proxy settings
    pub proxy: ProxyConfig,

    /// Background loop cadence and expiry windows
    pub timing: TimingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            runtime: RuntimeConfig::default(),
            repo: RepoConfig::default(),
            build: BuildConfig::default(),
            environments: vec![EnvironmentConfig::default()],
            lifecycle: LifecycleConfig::default(),
            image_runner: ImageRunnerConfig::default(),
            proxy: ProxyConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl Config {
    /// Name of the default environment
    pub fn default_environment(&self) -> &str {
        self.environments
            .first()
            .map(|e| e.name.as_str())
            .unwrap_or(DEFAULT_ENVIRONMENT)
    }

    /// Look up a supported environment by name
    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }

    /// Names of all supported environments, default first
    pub fn environment_names(&self) -> Vec<String> {
        self.environments.iter().map(|e| e.name.clone()).collect()
    }
}

const DEFAULT_ENVIRONMENT: &str = "production";

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen: String,

    /// Scheme used for redirects when the request carries no X-Forwarded-Proto
    pub scheme: String,

    /// Largest request body buffered for proxying
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            scheme: "http".to_string(),
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Process log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for the rotated JSON log
    pub dir: PathBuf,

    /// Number of hourly log files to keep
    pub max_files: usize,

    /// Recent log lines kept in memory for the debug view
    pub ring_buffer: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            max_files: 30,
            ring_buffer: 500,
        }
    }
}

/// Container runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker-compatible CLI to drive
    pub binary: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

/// Tracked source repository
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Project identifier, "owner/name"
    pub project: String,

    /// Clone URL, defaults to the GitHub URL of `project`
    pub remote_url: Option<String>,

    /// Local mirror location, defaults to the state directory
    pub mirror_dir: Option<PathBuf>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            project: "example/app".to_string(),
            remote_url: None,
            mirror_dir: None,
        }
    }
}

impl RepoConfig {
    /// Project identifier usable in file names
    pub fn slug(&self) -> String {
        self.project.replace('/', "-")
    }

    /// URL the mirror is cloned from
    pub fn remote(&self) -> String {
        self.remote_url
            .clone()
            .unwrap_or_else(|| format!("https://github.com/{}.git", self.project))
    }
}

/// Image build settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Port the application listens on inside the container
    pub exposed_port: u16,

    /// File name of the per-build log inside the build directory
    pub log_filename: String,

    /// Image repository name, tags are `<tag_prefix>:<hash>`
    pub tag_prefix: String,

    /// Builds allowed to run at once
    pub max_concurrent_builds: usize,

    /// Parent of per-build working directories, defaults to the OS temp dir
    pub build_root: Option<PathBuf>,

    /// How many workers each build is told to use
    pub workers: WorkerPolicy,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            exposed_port: 3000,
            log_filename: "previewd-build-log.txt".to_string(),
            tag_prefix: "previewd".to_string(),
            max_concurrent_builds: 2,
            build_root: None,
            workers: WorkerPolicy::CpuShare,
        }
    }
}

impl BuildConfig {
    /// Parent of per-build working directories
    pub fn build_root(&self) -> PathBuf {
        self.build_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Build concurrency hint passed to the image build as `workers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum WorkerPolicy {
    /// CPU count divided by the concurrent build limit
    CpuShare,
    /// Always the same number
    Fixed { workers: usize },
    /// A random pick from `choices`, capped by the CPU share
    Sampled { choices: Vec<usize> },
}

/// One supported environment and its container variables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Environment name, used in hostnames and labels
    pub name: String,

    /// Variables passed to containers started for this environment
    pub env: BTreeMap<String, String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("NODE_ENV".to_string(), "production".to_string());
        Self {
            name: DEFAULT_ENVIRONMENT.to_string(),
            env,
        }
    }
}

/// How a container start is confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Fire a run and treat a quiet grace period as success
    Optimistic,
    /// Create, then start, and trust the runtime's answer
    Confirmed,
}

/// Container start/stop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Launch strategy for commit containers
    pub launch: LaunchMode,

    /// Grace period of the optimistic launcher
    pub start_grace_secs: u64,

    /// Time a container gets to stop before it is killed
    pub stop_grace_secs: u64,

    /// How long a revive waits for a restarting container
    pub revive_timeout_secs: u64,

    /// Label recording which environment a container runs
    pub environment_label: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            launch: LaunchMode::Optimistic,
            start_grace_secs: 5,
            stop_grace_secs: 10,
            revive_timeout_secs: 60,
            environment_label: "previewEnvironment".to_string(),
        }
    }
}

/// Registry image runner policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageRunnerConfig {
    /// Allowed `registry/namespace` prefixes
    pub allowed_registries: Vec<String>,

    /// Labels an image must carry before it is run
    pub required_labels: BTreeMap<String, String>,
}

/// Reverse proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Retries after a connection reset
    pub retries: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self { retries: 3 }
    }
}

/// Background loop cadence and expiry windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub image_refresh_secs: u64,
    pub container_refresh_secs: u64,
    pub branch_refresh_secs: u64,
    pub queue_drain_millis: u64,
    pub queue_warn_secs: u64,
    pub expiry_sweep_secs: u64,
    /// Sweeps are held back this long after startup
    pub expiry_initial_delay_secs: u64,
    /// Idle time after which a running container is reclaimed
    pub container_expiry_secs: u64,
    /// Containers younger than this are never reclaimed
    pub container_min_age_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            image_refresh_secs: 5,
            container_refresh_secs: 5,
            branch_refresh_secs: 5 * 60,
            queue_drain_millis: 1000,
            queue_warn_secs: 60,
            expiry_sweep_secs: 5 * 60,
            expiry_initial_delay_secs: 20 * 60,
            container_expiry_secs: 2 * 60 * 60,
            container_min_age_secs: 20 * 60,
        }
    }
}

impl TimingConfig {
    pub fn image_refresh(&self) -> Duration {
        Duration::from_secs(self.image_refresh_secs.max(1))
    }

    pub fn container_refresh(&self) -> Duration {
        Duration::from_secs(self.container_refresh_secs.max(1))
    }

    pub fn branch_refresh(&self) -> Duration {
        Duration::from_secs(self.branch_refresh_secs.max(1))
    }

    pub fn queue_drain(&self) -> Duration {
        Duration::from_millis(self.queue_drain_millis.max(10))
    }

    pub fn queue_warn(&self) -> Duration {
        Duration::from_secs(self.queue_warn_secs.max(1))
    }

    pub fn expiry_sweep(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_secs.max(1))
    }

    pub fn expiry_initial_delay(&self) -> Duration {
        Duration::from_secs(self.expiry_initial_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[build]"));
        assert!(toml.contains("[[environments]]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.build.tag_prefix, "previewd");
        assert_eq!(config.default_environment(), "production");
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [repo]
            project = "acme/shop"

            [build]
            workers = { policy = "fixed", workers = 3 }

            [[environments]]
            name = "stage"
            env = { APP_ENV = "stage" }

            [[environments]]
            name = "prod"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.repo.slug(), "acme-shop");
        assert_eq!(config.repo.remote(), "https://github.com/acme/shop.git");
        assert_eq!(config.build.workers, WorkerPolicy::Fixed { workers: 3 });
        assert_eq!(config.build.exposed_port, 3000); // default preserved
        assert_eq!(config.default_environment(), "stage");
        assert!(config.environment("prod").is_some());
        assert_eq!(config.environment_names(), vec!["stage", "prod"]);
    }

    #[test]
    fn launch_mode_parses_lowercase() {
        let config: Config = toml::from_str("[lifecycle]\nlaunch = \"confirmed\"").unwrap();
        assert_eq!(config.lifecycle.launch, LaunchMode::Confirmed);
    }
}
