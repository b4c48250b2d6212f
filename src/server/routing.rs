//! Request target resolution
//!
//! A request names what it wants through the query string (`image`, `hash`,
//! `branch`, `env`) or through its host name (`[env-]hash-<hex>.<domain>`,
//! `[env-]container-<name>.<domain>`).

use crate::config::Config;
use axum::http::header::HOST;
use axum::http::Request;
use regex::Regex;
use std::sync::OnceLock;
use url::Url;

/// Query parameters the router consumes; redirects drop them
const CONTROL_PARAMS: [&str; 4] = ["hash", "branch", "env", "image"];

// Environment labels match what config validation allows for names
fn hash_host_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|\.)(?:(?P<env>[a-z0-9]+)-)?hash-(?P<hash>[a-f0-9]+)\.")
            .expect("hash host pattern compiles")
    })
}

fn container_host_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:(?P<env>[a-z0-9]+)-)?container-(?P<name>\w+)\.")
            .expect("container host pattern compiles")
    })
}

/// Commit or branch named in the query string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Hash(String),
    Branch(String),
}

/// Where a request is headed, in resolution priority order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Run a registry image (`?image=`)
    Image { image: String, environment: String },
    /// An existing container (`container-<name>.` host)
    Container { name: String },
    /// Send the client to the hash host for a commit or branch
    Redirect {
        reference: Reference,
        environment: String,
    },
    /// A commit named by the host
    Hash { hash: String, environment: String },
    /// Nothing to go on
    Unknown,
}

/// The parts of a request the router looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl RequestInfo {
    /// Read scheme, host, path and query from a request
    ///
    /// The scheme comes from `X-Forwarded-Proto` when a front proxy set it.
    pub fn from_request<B>(req: &Request<B>, default_scheme: &str) -> Self {
        let scheme = req
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default_scheme.to_string());

        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default()
            .to_ascii_lowercase();

        let query = req
            .uri()
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        Self {
            scheme,
            host,
            path: req.uri().path().to_string(),
            query,
        }
    }

    /// First value of a query parameter
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether a query parameter is present, with or without a value
    pub fn has_param(&self, key: &str) -> bool {
        self.query.iter().any(|(k, _)| k == key)
    }

    fn non_empty_param(&self, key: &str) -> Option<&str> {
        self.param(key).map(str::trim).filter(|v| !v.is_empty())
    }
}

/// Commit hash and optional environment prefix from a hash host
pub fn hash_from_host(host: &str) -> Option<(Option<&str>, &str)> {
    let caps = hash_host_pattern().captures(host)?;
    let env = caps.name("env").map(|m| m.as_str());
    let hash = caps.name("hash")?.as_str();
    Some((env, hash))
}

/// Container name from a container host
pub fn container_from_host(host: &str) -> Option<&str> {
    container_host_pattern()
        .captures(host)?
        .name("name")
        .map(|m| m.as_str())
}

/// Host with any hash or container label removed
pub fn base_domain(host: &str) -> &str {
    if let Some(m) = hash_host_pattern().find(host) {
        return &host[m.end()..];
    }
    if let Some(m) = container_host_pattern().find(host) {
        return &host[m.end()..];
    }
    host
}

/// A known environment name, or the default one
pub fn normalize_environment(config: &Config, requested: Option<&str>) -> String {
    match requested {
        Some(name) if config.environment(name).is_some() => name.to_string(),
        _ => config.default_environment().to_string(),
    }
}

/// Resolve where a request is headed
pub fn resolve(info: &RequestInfo, config: &Config) -> Target {
    let environment = normalize_environment(config, info.param("env"));

    if let Some(image) = info.non_empty_param("image") {
        return Target::Image {
            image: image.to_string(),
            environment,
        };
    }

    if let Some(name) = container_from_host(&info.host) {
        return Target::Container {
            name: name.to_string(),
        };
    }

    if let Some(hash) = info.non_empty_param("hash") {
        return Target::Redirect {
            reference: Reference::Hash(hash.to_ascii_lowercase()),
            environment,
        };
    }
    if let Some(branch) = info.non_empty_param("branch") {
        return Target::Redirect {
            reference: Reference::Branch(branch.to_string()),
            environment,
        };
    }

    if let Some((env, hash)) = hash_from_host(&info.host) {
        return Target::Hash {
            hash: hash.to_string(),
            environment: normalize_environment(config, env),
        };
    }

    Target::Unknown
}

fn environment_prefix(config: &Config, environment: &str) -> String {
    if environment == config.default_environment() {
        String::new()
    } else {
        format!("{}-", environment)
    }
}

/// Canonical URL for a commit: `[env-]hash-<hash>.<domain>` plus path and
/// non-control query parameters
pub fn hash_url(info: &RequestInfo, config: &Config, hash: &str, environment: &str) -> String {
    let host = format!(
        "{}hash-{}.{}",
        environment_prefix(config, environment),
        hash,
        base_domain(&info.host)
    );
    assemble(info, &host, &CONTROL_PARAMS)
}

/// URL of a container: `[env-]container-<name>.<domain>` plus path and
/// non-control query parameters
pub fn container_url(
    info: &RequestInfo,
    config: &Config,
    name: &str,
    environment: Option<&str>,
) -> String {
    let prefix = environment
        .map(|env| environment_prefix(config, env))
        .unwrap_or_default();
    let host = format!("{}container-{}.{}", prefix, name, base_domain(&info.host));
    assemble(info, &host, &CONTROL_PARAMS)
}

/// The request's own URL without the given query parameters
pub fn same_url_without(info: &RequestInfo, drop: &[&str]) -> String {
    assemble(info, &info.host, drop)
}

fn assemble(info: &RequestInfo, host: &str, drop: &[&str]) -> String {
    let kept: Vec<&(String, String)> = info
        .query
        .iter()
        .filter(|(k, _)| !drop.contains(&k.as_str()))
        .collect();

    match Url::parse(&format!("{}://{}", info.scheme, host)) {
        Ok(mut url) => {
            url.set_path(&info.path);
            if !kept.is_empty() {
                let mut pairs = url.query_pairs_mut();
                for (k, v) in kept {
                    pairs.append_pair(k, v);
                }
            }
            url.to_string()
        }
        Err(_) => format!("{}://{}{}", info.scheme, host, info.path),
    }
}
