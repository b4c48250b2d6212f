//! Docker CLI container runtime
//!
//! Implements the ContainerRuntime trait by executing the `docker` binary
//! (or a CLI-compatible `podman`) and parsing its JSON `inspect` output.

use crate::error::{PreviewError, PreviewResult};
use crate::orchestration::output;
use crate::orchestration::runtime::{BuildContext, ContainerRuntime, ProgressFn};
use crate::orchestration::types::{
    BuildOptions, ContainerConfig, ContainerInfo, ContainerState, ImageInfo, PortMapping,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Container runtime driving a Docker-compatible CLI
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    /// Create a runtime for the given CLI binary
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary, args.first().copied().unwrap_or_default())
    }

    /// Execute a CLI command and return the output
    async fn exec(&self, args: &[&str]) -> PreviewResult<std::process::Output> {
        debug!("Executing: {} {:?}", self.binary, args);

        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PreviewError::command_failed(self.describe(args), e))
    }

    /// Execute a command and fail on a non-zero exit
    async fn exec_ok(&self, args: &[&str]) -> PreviewResult<String> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(PreviewError::command_exec(self.describe(args), stderr))
        }
    }

    /// Spawn a command with piped output for progress streaming
    fn spawn_piped(&self, args: &[&str], stdin: bool) -> PreviewResult<tokio::process::Child> {
        debug!("Spawning: {} {:?}", self.binary, args);

        Command::new(&self.binary)
            .args(args)
            .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PreviewError::command_failed(self.describe(args), e))
    }

    /// Build the argument list shared by `run` and `create`
    fn push_container_args(args: &mut Vec<String>, config: &ContainerConfig) {
        if let Some(name) = &config.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        for (k, v) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", k, v));
        }

        for (k, v) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }

        args.push("-p".to_string());
        args.push(format!(
            "127.0.0.1:{}:{}/tcp",
            config.host_port, config.exposed_port
        ));

        args.push(config.image.clone());
    }

    /// List IDs from a quiet listing, deduplicated in order
    async fn list_ids(&self, args: &[&str]) -> PreviewResult<Vec<String>> {
        let stdout = self.exec_ok(args).await?;
        let mut seen = HashSet::new();
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| seen.insert(line.to_string()))
            .map(String::from)
            .collect())
    }

    async fn inspect_containers(&self, ids: &[String]) -> PreviewResult<Vec<ContainerInfo>> {
        let mut args = vec!["container", "inspect"];
        args.extend(ids.iter().map(String::as_str));
        let output = self.exec(&args).await?;

        if output.status.success() {
            return parse_container_inspect(&String::from_utf8_lossy(&output.stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !is_missing(&stderr) {
            return Err(PreviewError::command_exec("container inspect", stderr));
        }

        // A container vanished between listing and inspecting, go one by one
        let mut containers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(container) = self.inspect_container(id).await? {
                containers.push(container);
            }
        }
        Ok(containers)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn is_available(&self) -> PreviewResult<bool> {
        let output = Command::new(&self.binary)
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        Ok(output.map(|s| s.success()).unwrap_or(false))
    }

    async fn list_images(&self) -> PreviewResult<Vec<ImageInfo>> {
        let ids = self.list_ids(&["image", "ls", "-q", "--no-trunc"]).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["image", "inspect"];
        args.extend(ids.iter().map(String::as_str));
        let stdout = self.exec_ok(&args).await?;
        parse_image_inspect(&stdout)
    }

    async fn list_containers(&self) -> PreviewResult<Vec<ContainerInfo>> {
        let ids = self.list_ids(&["ps", "-a", "-q", "--no-trunc"]).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.inspect_containers(&ids).await
    }

    async fn inspect_container(&self, id: &str) -> PreviewResult<Option<ContainerInfo>> {
        let output = self.exec(&["container", "inspect", id]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Ok(None);
            }
            return Err(PreviewError::command_exec("container inspect", stderr));
        }

        let mut containers = parse_container_inspect(&String::from_utf8_lossy(&output.stdout))?;
        Ok(containers.pop())
    }

    async fn build_image(
        &self,
        mut context: BuildContext,
        options: &BuildOptions,
        on_output: ProgressFn<'_>,
    ) -> PreviewResult<()> {
        let mut args = vec![
            "build".to_string(),
            "-t".to_string(),
            options.tag.clone(),
            "--force-rm".to_string(),
        ];
        for (k, v) in &options.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", k, v));
        }
        // Build context is read from stdin
        args.push("-".to_string());

        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut child = self.spawn_piped(&args_refs, true)?;

        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                while let Some(chunk) = context.recv().await {
                    stdin.write_all(&chunk).await?;
                }
                stdin.shutdown().await
            })
        });

        let tail = output::follow(&mut child, on_output).await;

        let status = child
            .wait()
            .await
            .map_err(|e| PreviewError::command_failed("build", e))?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Err(e)) => warn!(tag = %options.tag, error = %e, "Failed to stream build context"),
                Err(e) => warn!(tag = %options.tag, error = %e, "Build context writer panicked"),
                Ok(Ok(())) => {}
            }
        }

        if !status.success() {
            return Err(PreviewError::ImageBuild {
                tag: options.tag.clone(),
                reason: tail.render(),
            });
        }

        Ok(())
    }

    async fn pull_image(&self, image: &str, on_output: ProgressFn<'_>) -> PreviewResult<()> {
        info!("Pulling image: {}", image);

        let mut child = self.spawn_piped(&["pull", image], false)?;
        let tail = output::follow(&mut child, on_output).await;
        let status = child
            .wait()
            .await
            .map_err(|e| PreviewError::command_failed("pull", e))?;

        if status.success() {
            return Ok(());
        }

        if MISSING_IMAGE.iter().any(|m| tail.mentions(m)) {
            Err(PreviewError::ImageNotFound {
                image: image.to_string(),
            })
        } else {
            Err(PreviewError::ImagePull {
                image: image.to_string(),
                reason: tail.render(),
            })
        }
    }

    async fn run(&self, config: &ContainerConfig) -> PreviewResult<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        Self::push_container_args(&mut args, config);

        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.exec(&args_refs).await?;

        if output.status.success() {
            let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
            info!(
                "Container started: {}",
                &container_id[..12.min(container_id.len())]
            );
            Ok(container_id)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(PreviewError::ContainerStart(stderr.trim().to_string()))
        }
    }

    async fn create(&self, config: &ContainerConfig) -> PreviewResult<String> {
        let mut args = vec!["create".to_string()];
        Self::push_container_args(&mut args, config);

        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.exec(&args_refs).await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(PreviewError::ContainerStart(stderr.trim().to_string()))
        }
    }

    async fn start(&self, id: &str) -> PreviewResult<()> {
        debug!("Starting container: {}", id);

        let output = self.exec(&["start", id]).await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                Err(PreviewError::ContainerNotFound(id.to_string()))
            } else {
                Err(PreviewError::ContainerStart(stderr.trim().to_string()))
            }
        }
    }

    async fn stop(&self, id: &str, grace_secs: u64) -> PreviewResult<()> {
        debug!("Stopping container: {}", id);

        let grace = grace_secs.to_string();
        self.exec_ok(&["stop", "-t", &grace, id]).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> PreviewResult<()> {
        debug!("Removing container: {}", id);

        let output = self.exec(&["rm", "-f", id]).await?;

        if output.status.success() {
            Ok(())
        } else {
            // Ignore error if container doesn't exist
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                Ok(())
            } else {
                Err(PreviewError::command_exec("rm", stderr))
            }
        }
    }

    async fn remove_image(&self, image: &str) -> PreviewResult<()> {
        debug!("Removing image: {}", image);

        let output = self.exec(&["rmi", "-f", image]).await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) || is_missing_image(&stderr) {
                Ok(())
            } else {
                Err(PreviewError::command_exec("rmi", stderr))
            }
        }
    }

    fn runtime_name(&self) -> &'static str {
        "Docker CLI"
    }
}

fn is_missing(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such container")
        || stderr.contains("no such object")
        || stderr.contains("no such image")
        || stderr.contains("no container with name or id")
}

/// Runtime messages meaning the image does not exist
const MISSING_IMAGE: [&str; 5] = [
    "manifest unknown",
    "not found",
    "image not known",
    "pull access denied",
    "does not exist",
];

fn is_missing_image(output: &str) -> bool {
    let output = output.to_ascii_lowercase();
    MISSING_IMAGE.iter().any(|m| output.contains(m))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawImage {
    id: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    config: Option<RawConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawConfig {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    state: Option<RawState>,
    #[serde(default)]
    config: Option<RawConfig>,
    #[serde(default)]
    network_settings: Option<RawNetwork>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawState {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<RawBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawBinding {
    #[serde(default)]
    host_port: String,
}

fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Parse `image inspect` JSON
pub(crate) fn parse_image_inspect(json: &str) -> PreviewResult<Vec<ImageInfo>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<RawImage> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|image| {
            let config = image.config.unwrap_or_default();
            ImageInfo {
                id: image.id,
                tags: image
                    .repo_tags
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|t| t != "<none>:<none>")
                    .collect(),
                size: image.size,
                created_at: parse_timestamp(image.created.as_deref()),
                labels: config.labels.unwrap_or_default(),
            }
        })
        .collect())
}

/// Parse `container inspect` JSON
pub(crate) fn parse_container_inspect(json: &str) -> PreviewResult<Vec<ContainerInfo>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<RawContainer> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|container| {
            let config = container.config.unwrap_or_default();
            let mut ports: Vec<PortMapping> = container
                .network_settings
                .and_then(|n| n.ports)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|(key, bindings)| {
                    let private_port = key.split('/').next()?.parse::<u16>().ok()?;
                    let public_port = bindings
                        .unwrap_or_default()
                        .iter()
                        .find_map(|b| b.host_port.parse::<u16>().ok());
                    Some(PortMapping {
                        private_port,
                        public_port,
                    })
                })
                .collect();
            ports.sort_by_key(|p| p.private_port);

            ContainerInfo {
                id: container.id,
                name: container.name.trim_start_matches('/').to_string(),
                image: config.image.unwrap_or_default(),
                state: container
                    .state
                    .map(|s| ContainerState::parse(&s.status))
                    .unwrap_or(ContainerState::Dead),
                ports,
                labels: config.labels.unwrap_or_default(),
                created_at: parse_timestamp(container.created.as_deref()),
            }
        })
        .collect())
}
