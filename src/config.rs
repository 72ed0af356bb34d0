use hyper::header::{HeaderName, HeaderValue};
use hyper::Method;
use serde::Deserialize;
use std::path::{Component, Path};
use std::time::Duration;

use crate::forward::Upstream;

/// Config file used when no path is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "corsgate.toml";

/// Global configuration for the dev server
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Cross-origin header policy
    #[serde(default)]
    pub cors: CorsConfig,

    /// API forwarding to the upstream backend
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Static bundle and SPA fallback
    #[serde(default, rename = "static")]
    pub static_files: StaticConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 3000, 0 picks an ephemeral port)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Seconds open connections get to finish after shutdown (default: 5)
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    /// Value of Access-Control-Allow-Origin
    #[serde(default = "default_allow_origin")]
    pub allow_origin: String,

    /// Methods listed in Access-Control-Allow-Methods
    #[serde(default = "default_allow_methods")]
    pub allow_methods: Vec<String>,

    /// Headers listed in Access-Control-Allow-Headers
    #[serde(default = "default_allow_headers")]
    pub allow_headers: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: default_allow_origin(),
            allow_methods: default_allow_methods(),
            allow_headers: default_allow_headers(),
        }
    }
}

impl CorsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if HeaderValue::from_str(&self.allow_origin).is_err() {
            return Err(format!(
                "cors: invalid allow_origin '{}'",
                self.allow_origin
            ));
        }

        for method in &self.allow_methods {
            if Method::from_bytes(method.as_bytes()).is_err() {
                return Err(format!("cors: invalid method '{}'", method));
            }
        }

        for header in &self.allow_headers {
            if HeaderName::from_bytes(header.as_bytes()).is_err() {
                return Err(format!("cors: invalid header name '{}'", header));
            }
        }

        Ok(())
    }
}

/// How the matched prefix is transformed before forwarding
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PathRewrite {
    /// Remove the prefix: /api/users -> /users
    #[default]
    Strip,
    /// Forward the path untouched: /api/users -> /api/users
    Preserve,
    /// Swap the prefix for another string: /api/users -> /v2/users
    Replace(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Path prefix claimed by the forwarder
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Upstream base URL, e.g. http://localhost:3001
    #[serde(default = "default_upstream")]
    pub upstream: String,

    /// Prefix rewrite policy
    #[serde(default)]
    pub rewrite: PathRewrite,

    /// Max seconds to wait for the upstream response head (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle upstream connections kept alive (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Add X-Forwarded-For/Host/Proto to forwarded requests
    #[serde(default)]
    pub forwarded_headers: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            upstream: default_upstream(),
            rewrite: PathRewrite::default(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            forwarded_headers: false,
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.prefix.starts_with('/') {
            return Err(format!("proxy: prefix '{}' must start with '/'", self.prefix));
        }
        if self.prefix.len() > 1 && self.prefix.ends_with('/') {
            return Err(format!(
                "proxy: prefix '{}' must not end with '/'",
                self.prefix
            ));
        }
        if let PathRewrite::Replace(replacement) = &self.rewrite {
            if !replacement.is_empty() && !replacement.starts_with('/') {
                return Err(format!(
                    "proxy: rewrite replacement '{}' must start with '/'",
                    replacement
                ));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err("proxy: 'request_timeout_secs' must be greater than 0".to_string());
        }

        Upstream::parse(&self.upstream)
            .map(|_| ())
            .map_err(|e| format!("proxy: {}", e))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StaticConfig {
    /// Directory holding the built web bundle
    #[serde(default = "default_static_root")]
    pub root: String,

    /// Entry document served for unmatched routes, relative to root
    #[serde(default = "default_fallback")]
    pub fallback: String,

    /// Files tried when a request resolves to a directory
    #[serde(default = "default_index_files")]
    pub index_files: Vec<String>,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            root: default_static_root(),
            fallback: default_fallback(),
            index_files: default_index_files(),
        }
    }
}

impl StaticConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.root.is_empty() {
            return Err("static: 'root' must not be empty".to_string());
        }
        if !is_plain_relative(&self.fallback) {
            return Err(format!(
                "static: fallback '{}' must be a relative path inside the root",
                self.fallback
            ));
        }
        for index in &self.index_files {
            if !is_plain_relative(index) {
                return Err(format!(
                    "static: index file '{}' must be a relative path inside the root",
                    index
                ));
            }
        }
        Ok(())
    }
}

/// True for a non-empty relative path without `..` or root components
fn is_plain_relative(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    3000
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_allow_origin() -> String {
    "*".to_string()
}

fn default_allow_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_allow_headers() -> Vec<String> {
    ["Content-Type", "Authorization", "Accept"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}

fn default_prefix() -> String {
    "/api".to_string()
}

fn default_upstream() -> String {
    "http://localhost:3001".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_static_root() -> String {
    "build/web".to_string()
}

fn default_fallback() -> String {
    "index.html".to_string()
}

fn default_index_files() -> Vec<String> {
    vec!["index.html".to_string()]
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load an explicitly named config, or the default file if it exists,
    /// or fall back to built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH),
            None => {
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for result in [
            self.cors.validate(),
            self.proxy.validate(),
            self.static_files.validate(),
        ] {
            if let Err(e) = result {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
