//! Reverse proxy to container ports
//!
//! Requests are buffered so they can be replayed when the container resets
//! the connection, which happens while a freshly started app is still
//! binding its port. Responses are streamed back.

use crate::config::Config;
use crate::error::{PreviewError, PreviewResult};
use axum::body::{self, Body};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName};
use axum::response::Response;
use std::error::Error as StdError;
use std::future::Future;
use std::io;
use tracing::{debug, warn};

/// Headers that describe one connection and must not be forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether an error was caused by the peer resetting the connection
pub fn is_connection_reset(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::ConnectionReset {
                return true;
            }
        }
        current = err.source();
    }
    false
}

/// Run `attempt`, retrying up to `retries` more times while it fails with a
/// connection reset; any other error is returned at once
pub async fn retry_on_reset<T, E, F, Fut>(retries: u32, mut attempt: F) -> Result<T, E>
where
    E: StdError + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut remaining = retries;
    loop {
        match attempt().await {
            Err(e) if remaining > 0 && is_connection_reset(&e) => {
                remaining -= 1;
                debug!(remaining, "Connection reset by container, retrying");
            }
            result => return result,
        }
    }
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || name.as_str() == "content-length" {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// HTTP client forwarding requests to `127.0.0.1:<port>`
pub struct Proxy {
    client: reqwest::Client,
    retries: u32,
    max_body_bytes: usize,
}

impl Proxy {
    pub fn new(config: &Config) -> PreviewResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| PreviewError::Internal(format!("building proxy client: {}", e)))?;

        Ok(Self {
            client,
            retries: config.proxy.retries,
            max_body_bytes: config.server.max_body_bytes,
        })
    }

    /// Forward `req` to the container published on `port`
    pub async fn forward(&self, req: Request, port: u16) -> PreviewResult<Response> {
        let (parts, body) = req.into_parts();
        let body = body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| PreviewError::Proxy {
                port,
                reason: format!("reading request body: {}", e),
            })?;

        let path = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let url = format!("http://127.0.0.1:{}{}", port, path);
        let headers = forwardable(&parts.headers);

        let upstream = retry_on_reset(self.retries, || {
            self.client
                .request(parts.method.clone(), &url)
                .headers(headers.clone())
                .body(body.clone())
                .send()
        })
        .await
        .map_err(|e| {
            warn!(port, url = %url, error = %e, "Error proxying request to container");
            PreviewError::Proxy {
                port,
                reason: e.to_string(),
            }
        })?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(out) = response.headers_mut() {
            for (name, value) in upstream.headers() {
                if !is_hop_by_hop(name) {
                    out.append(name.clone(), value.clone());
                }
            }
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| PreviewError::Internal(format!("building proxied response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "request failed")
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    fn reset() -> Wrapped {
        Wrapped(io::Error::new(io::ErrorKind::ConnectionReset, "socket hang up"))
    }

    #[tokio::test]
    async fn resets_are_retried_within_budget() {
        let attempts = AtomicUsize::new(0);

        let result = retry_on_reset(3, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(reset())
                } else {
                    Ok("delivered")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "delivered");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_exhaustion_surfaces_the_reset() {
        let attempts = AtomicUsize::new(0);

        let result: Result<(), Wrapped> = retry_on_reset(3, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(reset()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let attempts = AtomicUsize::new(0);

        let result: Result<(), Wrapped> = retry_on_reset(3, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Wrapped(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("content-length", "12".parse().unwrap());
        headers.insert("cookie", "a=b".parse().unwrap());

        let out = forwardable(&headers);
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("cookie"));
    }

    async fn read_request_head(stream: &mut TcpStream) {
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => head.extend_from_slice(&buf[..n]),
            }
        }
    }

    /// Container that resets its first `resets` connections, then answers
    async fn flaky_container(resets: usize) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                read_request_head(&mut stream).await;
                if n < resets {
                    // Linger of zero turns the close into a RST
                    #[allow(deprecated)]
                    stream.set_linger(Some(Duration::ZERO)).unwrap();
                    drop(stream);
                } else {
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                        )
                        .await;
                    let _ = stream.shutdown().await;
                }
            }
        });

        (port, hits)
    }

    fn proxy(retries: u32) -> Proxy {
        let mut config = Config::default();
        config.proxy.retries = retries;
        Proxy::new(&config).unwrap()
    }

    fn request() -> Request {
        Request::builder()
            .uri("/health?check=1")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn forward_survives_container_resets() {
        let (port, hits) = flaky_container(2).await;

        let response = proxy(3).forward(request(), port).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn forward_gives_up_after_retry_budget() {
        let (port, hits) = flaky_container(usize::MAX).await;

        let err = proxy(1).forward(request(), port).await.unwrap_err();

        assert!(matches!(err, PreviewError::Proxy { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
