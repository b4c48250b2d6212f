//! Container runtime shared types
//!
//! Read-only mirrors of what the runtime reports, plus the launch
//! configuration handed to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A local image as reported by the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Image ID
    pub id: String,
    /// Repository tags (`name:tag`), empty for dangling images
    pub tags: Vec<String>,
    /// Size in bytes
    pub size: u64,
    /// When the image was built
    pub created_at: DateTime<Utc>,
    /// Image labels
    pub labels: HashMap<String, String>,
}

/// Container state as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl ContainerState {
    /// Parse the runtime's state string, unknown states count as dead
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" | "stopped" => Self::Exited,
            _ => Self::Dead,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
        };
        write!(f, "{}", name)
    }
}

/// A published port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port inside the container
    pub private_port: u16,
    /// Port on the host, if published
    pub public_port: Option<u16>,
}

/// A container as reported by the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container ID
    pub id: String,
    /// Container name, without the leading slash
    pub name: String,
    /// Image reference the container was created from
    pub image: String,
    /// Current state
    pub state: ContainerState,
    /// Port mappings
    pub ports: Vec<PortMapping>,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// When the container was created
    pub created_at: DateTime<Utc>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    /// First published host port
    pub fn public_port(&self) -> Option<u16> {
        self.ports.iter().find_map(|p| p.public_port)
    }

    /// Value of a label
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Short ID for log lines
    pub fn short_id(&self) -> &str {
        &self.id[..12.min(self.id.len())]
    }
}

/// Configuration for creating a new container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerConfig {
    /// Image to run
    pub image: String,
    /// Optional fixed container name
    pub name: Option<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Port inside the container
    pub exposed_port: u16,
    /// Host port bound to `exposed_port`
    pub host_port: u16,
}

/// Options for an image build
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    /// Tag to apply to the built image
    pub tag: String,
    /// Build arguments
    pub build_args: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(state: ContainerState) -> ContainerInfo {
        ContainerInfo {
            id: "0123456789abcdef0123".to_string(),
            name: "eager_hopper".to_string(),
            image: "previewd:abc".to_string(),
            state,
            ports: vec![
                PortMapping {
                    private_port: 9229,
                    public_port: None,
                },
                PortMapping {
                    private_port: 3000,
                    public_port: Some(49153),
                },
            ],
            labels: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn state_parse() {
        assert_eq!(ContainerState::parse("running"), ContainerState::Running);
        assert_eq!(ContainerState::parse("Exited"), ContainerState::Exited);
        assert_eq!(ContainerState::parse("stopped"), ContainerState::Exited);
        assert_eq!(ContainerState::parse("???"), ContainerState::Dead);
    }

    #[test]
    fn public_port_skips_unpublished() {
        assert_eq!(container(ContainerState::Running).public_port(), Some(49153));
    }

    #[test]
    fn short_id_is_twelve_chars() {
        let c = container(ContainerState::Running);
        assert_eq!(c.short_id(), "0123456789ab");
        assert!(c.is_running());
        assert!(!container(ContainerState::Exited).is_running());
    }
}
