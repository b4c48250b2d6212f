//! HTTP front end
//!
//! Every request not aimed at a control route is resolved to a commit, a
//! branch, a registry image or a container, and then proxied, started,
//! built or redirected accordingly.

mod image_runner;
mod proxy;
mod routing;

pub use image_runner::{check_labels, ImageReference};
pub use proxy::{is_connection_reset, retry_on_reset, Proxy};
pub use routing::{resolve, Reference, RequestInfo, Target};

use crate::build::format_log;
use crate::daemon::{BuildStatus, DebugSnapshot, Orchestrator};
use crate::error::{PreviewError, PreviewResult};
use crate::orchestration::{ContainerInfo, ImageInfo};
use crate::source::is_commit_hash;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_TYPE, LOCATION, RETRY_AFTER};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use routing::{hash_url, same_url_without};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Branch refreshes tried before a branch is reported unknown
const BRANCH_RETRIES: usize = 2;

/// Build log lines shown on the building page
const LOG_TAIL_LINES: usize = 40;

/// Seconds a client is asked to wait after a transient failure
const RETRY_AFTER_SECS: &str = "5";

impl IntoResponse for PreviewError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        } else {
            debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        if self.is_retryable() {
            return (status, [(RETRY_AFTER, RETRY_AFTER_SECS)], self.to_string()).into_response();
        }
        (status, self.to_string()).into_response()
    }
}

pub(crate) fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// 302 to `url`
pub(crate) fn found(url: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, url.to_string())]).into_response()
}

fn html(status: StatusCode, body: String) -> Response {
    (status, [(CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response()
}

/// Page that reloads itself (or goes to `url`) after `seconds`
fn refresh_page(seconds: u32, url: Option<&str>, title: &str, detail: Option<&str>) -> String {
    let target = url
        .map(|u| format!(";url={}", escape_html(u)))
        .unwrap_or_default();
    let detail = detail
        .map(|d| format!("<pre>{}</pre>", escape_html(d)))
        .unwrap_or_default();
    format!(
        "<!DOCTYPE html><html><head><meta http-equiv=\"refresh\" content=\"{}{}\"><title>{}</title></head><body><h1>{}</h1>{}</body></html>",
        seconds,
        target,
        escape_html(title),
        escape_html(title),
        detail
    )
}

/// Shared state of the HTTP handlers
pub struct PreviewServer {
    orch: Arc<Orchestrator>,
    proxy: Proxy,
}

impl PreviewServer {
    pub fn new(orch: Arc<Orchestrator>) -> PreviewResult<Self> {
        let proxy = Proxy::new(&orch.config)?;
        Ok(Self { orch, proxy })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/status", get(Self::status))
            .route("/debug", get(Self::debug))
            .route("/log", get(Self::log))
            .route("/localimages", get(Self::local_images))
            .fallback(Self::main)
            .with_state(self)
    }

    async fn status(
        State(server): State<Arc<Self>>,
        req: Request,
    ) -> PreviewResult<Response> {
        let info = server.request_info(&req);
        let (hash, environment) = server.requested_hash(&info).await?;

        let status = server.orch.status_for(&hash, &environment).await;
        if status == BuildStatus::NotBuilt {
            server.orch.enqueue_in_background(&hash);
        }
        Ok(status.to_string().into_response())
    }

    async fn debug(State(server): State<Arc<Self>>) -> Json<DebugSnapshot> {
        Json(server.orch.snapshot())
    }

    async fn local_images(State(server): State<Arc<Self>>) -> Json<Vec<ImageInfo>> {
        Json(server.orch.local_images())
    }

    async fn log(State(server): State<Arc<Self>>, req: Request) -> PreviewResult<Response> {
        let info = server.request_info(&req);
        let (hash, _) = server.requested_hash(&info).await?;

        match server.orch.builds.read_build_log(&hash).await? {
            Some(content) => Ok(format_log(&content, None).into_response()),
            None => Ok((StatusCode::NOT_FOUND, format!("No build log for {}", hash)).into_response()),
        }
    }

    async fn main(State(server): State<Arc<Self>>, req: Request) -> PreviewResult<Response> {
        let info = server.request_info(&req);

        match resolve(&info, &server.orch.config) {
            Target::Image { image, environment } => {
                server.load_image(&info, &image, &environment).await
            }
            Target::Container { name } => server.to_container(req, &info, &name).await,
            Target::Redirect {
                reference,
                environment,
            } => {
                let hash = server.reference_hash(reference).await?;
                Ok(found(&hash_url(&info, &server.orch.config, &hash, &environment)))
            }
            Target::Hash { hash, environment } => {
                server.serve_hash(req, &info, &hash, &environment).await
            }
            Target::Unknown => Ok("Please specify a branch to load".into_response()),
        }
    }

    fn request_info(&self, req: &Request) -> RequestInfo {
        RequestInfo::from_request(req, &self.orch.config.server.scheme)
    }

    /// Commit and environment a control route is asking about
    async fn requested_hash(&self, info: &RequestInfo) -> PreviewResult<(String, String)> {
        match resolve(info, &self.orch.config) {
            Target::Redirect {
                reference,
                environment,
            } => Ok((self.reference_hash(reference).await?, environment)),
            Target::Hash { hash, environment } => Ok((hash, environment)),
            _ => Err(PreviewError::CommitNotFound(
                "no hash or branch in request".to_string(),
            )),
        }
    }

    async fn reference_hash(&self, reference: Reference) -> PreviewResult<String> {
        match reference {
            Reference::Hash(hash) if is_commit_hash(&hash) => Ok(hash),
            Reference::Hash(hash) => Err(PreviewError::CommitNotFound(hash)),
            Reference::Branch(branch) => self.branch_hash(&branch).await,
        }
    }

    /// Resolve a branch, refreshing branches a few times for fresh pushes
    async fn branch_hash(&self, branch: &str) -> PreviewResult<String> {
        let cache = &self.orch.cache;
        for attempt in 0..=BRANCH_RETRIES {
            if let Some(hash) = cache.branch_hash(branch) {
                return Ok(hash);
            }
            if attempt < BRANCH_RETRIES {
                debug!(branch = %branch, attempt, "Branch unknown, refreshing branches");
                if let Err(e) = cache.refresh_branches().await {
                    warn!(branch = %branch, error = %e, "Error refreshing branches");
                }
            }
        }
        Err(PreviewError::BranchNotFound(branch.to_string()))
    }

    /// Proxy, start, report or build a commit named by the host
    async fn serve_hash(
        &self,
        req: Request,
        info: &RequestInfo,
        hash: &str,
        environment: &str,
    ) -> PreviewResult<Response> {
        let orch = &self.orch;

        if info.has_param("reset") {
            orch.hard_reset(hash).await?;
            let back = same_url_without(info, &["reset"]);
            let title = format!("Hard reset of {} done, reloading", hash);
            return Ok(html(StatusCode::OK, refresh_page(3, Some(&back), &title, None)));
        }

        orch.access.touch(hash);

        if let Some(container) = orch.running_container_for(hash, environment) {
            return self.proxy_to(req, &container).await;
        }

        if orch.cache.has_image(&orch.image_for(hash)) {
            let reload = |detail: String| {
                let title = format!("Starting container for {}, reload shortly", hash);
                html(
                    StatusCode::SERVICE_UNAVAILABLE,
                    refresh_page(5, None, &title, Some(&detail)),
                )
            };
            return match orch.lifecycle.start_container(hash, environment).await {
                Ok(container) => match self.proxy_to(req, &container).await {
                    Ok(response) => Ok(response),
                    Err(e) => Ok(reload(e.to_string())),
                },
                Err(e) => {
                    warn!(commit_hash = %hash, error = %e, "Error starting container");
                    Ok(reload(e.to_string()))
                }
            };
        }

        if orch.builds.did_build_fail(hash) {
            let tail = self.log_tail(hash).await;
            let title = format!("Build failed for {}, retry with ?reset=1", hash);
            return Ok(html(
                StatusCode::OK,
                refresh_page(60, None, &title, Some(&tail)),
            ));
        }

        if orch.builds.is_build_in_progress(hash).await {
            let tail = self.log_tail(hash).await;
            let title = format!("Building {}", hash);
            return Ok(html(StatusCode::OK, refresh_page(5, None, &title, Some(&tail))));
        }

        orch.enqueue_in_background(hash);
        let title = format!("Starting build for {}", hash);
        Ok(html(StatusCode::OK, refresh_page(5, None, &title, None)))
    }

    async fn log_tail(&self, hash: &str) -> String {
        match self.orch.builds.read_build_log(hash).await {
            Ok(Some(content)) => format_log(&content, Some(LOG_TAIL_LINES)),
            Ok(None) => String::new(),
            Err(e) => {
                warn!(commit_hash = %hash, error = %e, "Error reading build log");
                String::new()
            }
        }
    }

    async fn proxy_to(&self, req: Request, container: &ContainerInfo) -> PreviewResult<Response> {
        let port = container.public_port().ok_or_else(|| PreviewError::Proxy {
            port: 0,
            reason: format!("container {} publishes no port", container.name),
        })?;
        self.proxy.forward(req, port).await
    }
}

/// Serve HTTP on `listen` until Ctrl-C
pub async fn serve(orch: Arc<Orchestrator>, listen: &str) -> PreviewResult<()> {
    let server = Arc::new(PreviewServer::new(orch)?);
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| PreviewError::io(format!("binding {}", listen), e))?;
    info!(listen = %listen, "Listening");

    axum::serve(listener, server.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| PreviewError::io("serving HTTP", e))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
