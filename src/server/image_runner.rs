//! Registry image runner
//!
//! `?image=<registry>/<namespace>/<name>:<tag>` finds or creates a container
//! for the image, pulling it first when needed, and sends the client to the
//! container's own host. `container-<name>.` hosts are proxied to that
//! container.

use super::routing::{container_url, RequestInfo};
use super::{escape_html, found, PreviewServer};
use crate::error::{PreviewError, PreviewResult};
use axum::body::Body;
use axum::extract::Request;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Delay before the pull page follows its redirect
const PULL_REDIRECT_DELAY_MS: u64 = 5000;

/// A parsed image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Everything before the final path segment (`registry/namespace`)
    pub registry: String,
    /// Final path segment
    pub name: String,
    /// Tag or digest, `latest` when absent
    pub tag: String,
}

impl ImageReference {
    pub fn parse(image: &str) -> PreviewResult<Self> {
        let invalid = |reason: &str| PreviewError::InvalidImage {
            image: image.to_string(),
            reason: reason.to_string(),
        };

        if image.is_empty() {
            return Err(invalid("empty image reference"));
        }
        if !image
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@'))
        {
            return Err(invalid("unexpected characters in image reference"));
        }

        let (registry, rest) = match image.rsplit_once('/') {
            Some((registry, rest)) => (registry, rest),
            None => ("", image),
        };
        let (name, tag) = match rest.split_once('@') {
            Some((name, digest)) => (name, digest),
            None => rest.split_once(':').unwrap_or((rest, "latest")),
        };
        let bad_registry = !registry.is_empty() && registry.split('/').any(str::is_empty);
        if name.is_empty() || tag.is_empty() || bad_registry {
            return Err(invalid("malformed image reference"));
        }

        Ok(Self {
            registry: registry.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Reject images from registries outside the allow-list
    pub fn check_registry(&self, allowed: &[String]) -> PreviewResult<()> {
        let registry = self.registry.trim_end_matches('/');
        if allowed
            .iter()
            .any(|a| a.trim_end_matches('/') == registry)
        {
            Ok(())
        } else {
            Err(PreviewError::InvalidRegistry {
                registry: self.registry.clone(),
            })
        }
    }
}

/// Reject images missing any required provenance label
pub fn check_labels(
    image: &str,
    labels: &HashMap<String, String>,
    required: &BTreeMap<String, String>,
) -> PreviewResult<()> {
    for (key, expected) in required {
        match labels.get(key) {
            Some(value) if value == expected => {}
            _ => {
                return Err(PreviewError::InvalidImage {
                    image: image.to_string(),
                    reason: format!("missing label {}={}", key, expected),
                })
            }
        }
    }
    Ok(())
}

/// What the pull task reports to the streaming response
enum PullEvent {
    Line(String),
    Ready(String),
    Failed(PreviewError),
}

impl PullEvent {
    fn render(self) -> String {
        match self {
            Self::Line(line) => {
                let line = serde_json::to_string(&line).unwrap_or(line);
                format!("{} - {}\n", Utc::now().timestamp_millis(), escape_html(&line))
            }
            Self::Ready(url) => {
                let url = serde_json::to_string(&url).unwrap_or_default();
                format!(
                    "</pre><script>setTimeout(() => document.location.href={}, {});</script></body>",
                    url, PULL_REDIRECT_DELAY_MS
                )
            }
            Self::Failed(e) => format!("</pre><p>{}</p></body>", escape_html(&e.to_string())),
        }
    }
}

impl PreviewServer {
    /// Find, create or pull-then-create a container for a registry image
    pub(super) async fn load_image(
        self: &Arc<Self>,
        info: &RequestInfo,
        image: &str,
        environment: &str,
    ) -> PreviewResult<Response> {
        let config = &self.orch.config;
        ImageReference::parse(image)?.check_registry(&config.image_runner.allowed_registries)?;

        let lifecycle = &self.orch.lifecycle;
        if let Some(existing) = lifecycle.find_container(image, environment) {
            let url = container_url(info, config, &existing.name, lifecycle.environment_of(&existing));
            return Ok(found(&url));
        }

        if let Some(local) = self.orch.cache.get_image(image) {
            check_labels(image, &local.labels, &config.image_runner.required_labels)?;
            let container = lifecycle.create_container(image, environment).await?;
            let url = container_url(info, config, &container.name, Some(environment));
            return Ok(found(&url));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(Arc::clone(self).pull_and_create(
            info.clone(),
            image.to_string(),
            environment.to_string(),
            tx,
        ));

        // Errors before any progress still get a proper status code
        let first = match rx.recv().await {
            Some(PullEvent::Failed(e)) => return Err(e),
            Some(event) => event,
            None => return Err(PreviewError::Internal("image pull task ended early".to_string())),
        };

        let head = stream::iter([
            "<!DOCTYPE html><body><pre>".to_string(),
            first.render(),
        ]);
        let rest = stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event.render(), rx))
        });
        let body = Body::from_stream(head.chain(rest).map(Ok::<_, Infallible>));

        Ok(([(CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response())
    }

    async fn pull_and_create(
        self: Arc<Self>,
        info: RequestInfo,
        image: String,
        environment: String,
        tx: mpsc::UnboundedSender<PullEvent>,
    ) {
        let event = match self.pull_then_create(&info, &image, &environment, &tx).await {
            Ok(url) => PullEvent::Ready(url),
            Err(e) => {
                warn!(image_name = %image, error = %e, "Error running registry image");
                PullEvent::Failed(e)
            }
        };
        let _ = tx.send(event);
    }

    async fn pull_then_create(
        &self,
        info: &RequestInfo,
        image: &str,
        environment: &str,
        tx: &mpsc::UnboundedSender<PullEvent>,
    ) -> PreviewResult<String> {
        let progress = tx.clone();
        let on_output = move |line: String| {
            let _ = progress.send(PullEvent::Line(line));
        };
        self.orch.lifecycle.pull_image(image, &on_output).await?;

        let labels = self
            .orch
            .cache
            .get_image(image)
            .map(|i| i.labels)
            .unwrap_or_default();
        check_labels(image, &labels, &self.orch.config.image_runner.required_labels)?;

        let container = self.orch.lifecycle.create_container(image, environment).await?;
        Ok(container_url(info, &self.orch.config, &container.name, Some(environment)))
    }

    /// Proxy to a container named by the host, reviving or deleting it
    pub(super) async fn to_container(
        &self,
        req: Request,
        info: &RequestInfo,
        name: &str,
    ) -> PreviewResult<Response> {
        let lifecycle = &self.orch.lifecycle;
        let container = lifecycle
            .find_container_by_name(name)
            .ok_or_else(|| PreviewError::ContainerNotFound(name.to_string()))?;

        if info.has_param("delete") {
            info!(container = %name, "Hard reset for container");
            lifecycle.delete_container(&container).await?;
            return Ok(format!("Container {} deleted", name).into_response());
        }

        let container = if container.is_running() {
            container
        } else {
            lifecycle.revive_container(&container).await?
        };

        self.orch.access.touch(name);
        self.proxy_to(req, &container).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registry_name_and_tag() {
        let r = ImageReference::parse("registry.example.com/team/app:build-4").unwrap();
        assert_eq!(r.registry, "registry.example.com/team");
        assert_eq!(r.name, "app");
        assert_eq!(r.tag, "build-4");

        let r = ImageReference::parse("registry.example.com/team/app").unwrap();
        assert_eq!(r.tag, "latest");

        let r = ImageReference::parse("registry.example.com/team/app@sha256:0f0e").unwrap();
        assert_eq!(r.name, "app");
        assert_eq!(r.tag, "sha256:0f0e");
    }

    #[test]
    fn rejects_malformed_references() {
        for bad in ["", "app:1 && rm", "registry//app:1", "team/:1"] {
            assert!(
                matches!(ImageReference::parse(bad), Err(PreviewError::InvalidImage { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn registry_allow_list() {
        let allowed = vec!["registry.example.com/team".to_string()];

        let ok = ImageReference::parse("registry.example.com/team/app:1").unwrap();
        assert!(ok.check_registry(&allowed).is_ok());

        let other = ImageReference::parse("registry.example.com/other/app:1").unwrap();
        let err = other.check_registry(&allowed).unwrap_err();
        assert_eq!(err.status_code(), 403);

        let hub = ImageReference::parse("nginx:latest").unwrap();
        assert!(hub.check_registry(&allowed).is_err());
    }

    #[test]
    fn provenance_labels_must_match() {
        let mut required = BTreeMap::new();
        required.insert("built-by".to_string(), "ci".to_string());

        let mut labels = HashMap::new();
        assert_eq!(
            check_labels("app:1", &labels, &required).unwrap_err().status_code(),
            403
        );

        labels.insert("built-by".to_string(), "laptop".to_string());
        assert!(check_labels("app:1", &labels, &required).is_err());

        labels.insert("built-by".to_string(), "ci".to_string());
        assert!(check_labels("app:1", &labels, &required).is_ok());
    }
}
