//! Error types for previewd
//!
//! All modules use `PreviewResult<T>` as their return type.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for previewd operations
pub type PreviewResult<T> = Result<T, PreviewError>;

/// All errors that can occur in previewd
#[derive(Error, Debug)]
pub enum PreviewError {
    // Validation errors
    #[error("Docker image not found: {image}")]
    ImageNotFound { image: String },

    #[error("Image is invalid: {image}: {reason}")]
    InvalidImage { image: String, reason: String },

    #[error("Docker registry is invalid: {registry}")]
    InvalidRegistry { registry: String },

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Could not find a hash for branch: {0}")]
    BranchNotFound(String),

    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    // Container errors
    #[error("Could not allocate a free port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("Container failed to start: {0}")]
    ContainerStart(String),

    #[error("Container {container} did not finish restarting within {seconds}s")]
    RestartTimeout { container: String, seconds: u64 },

    #[error("Image build failed: {tag}: {reason}")]
    ImageBuild { tag: String, reason: String },

    #[error("Image pull failed: {image}: {reason}")]
    ImagePull { image: String, reason: String },

    // Source control errors
    #[error("git {operation} failed: {reason}")]
    Git { operation: String, reason: String },

    // Proxy errors
    #[error("Proxy to port {port} failed: {reason}")]
    Proxy { port: u16, reason: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Outcome of a deduplicated operation, handed to every waiter
    #[error(transparent)]
    Shared(Arc<PreviewError>),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PreviewError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// The error behind any number of `Shared` wrappers
    pub fn root(&self) -> &PreviewError {
        match self {
            Self::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// HTTP status code this error maps to at the server boundary
    pub fn status_code(&self) -> u16 {
        match self.root() {
            Self::ImageNotFound { .. }
            | Self::ContainerNotFound(_)
            | Self::BranchNotFound(_)
            | Self::CommitNotFound(_) => 404,
            Self::InvalidImage { .. } | Self::InvalidRegistry { .. } => 403,
            _ => 500,
        }
    }

    /// Check if error is transient infrastructure trouble
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::PortAllocation(_)
                | Self::ContainerStart(_)
                | Self::RestartTimeout { .. }
                | Self::Git { .. }
                | Self::Proxy { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self.root() {
            Self::CommandFailed { .. } => {
                Some("Check that docker (or podman) and git are installed and on PATH")
            }
            Self::ConfigInvalid { .. } => Some("Run: previewd config show"),
            _ => None,
        }
    }
}

impl From<Arc<PreviewError>> for PreviewError {
    fn from(shared: Arc<PreviewError>) -> Self {
        Self::Shared(shared)
    }
}
