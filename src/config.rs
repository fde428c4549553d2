//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** - `TUNNEL_LISTEN`, `TUNNEL_DOMAIN`,
//!    `TUNNEL_HTTP_SCHEME`, `TUNNEL_PORT`, `TUNNEL_AUTH_TOKEN`
//! 2. **Config file** - path via `--config <path>`, or `tunneld.toml` in CWD
//! 3. **Compiled defaults** - see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! max_body_bytes = 8388608      # 8 MB, request and response bodies
//! static_dir = "./static"       # optional dashboard assets for the apex domain
//!
//! [tunnel]
//! path = "/tunnel"              # agent WebSocket endpoint
//! domain = "localhost"          # base domain; tunnels live at <sub>.<domain>
//! scheme = "http"               # scheme used in advertised public URLs
//! public_port = 8080            # optional, appended to public URLs
//! subdomain_policy = "overwrite" # or "reject"
//! request_timeout_secs = 60     # 0 = wait forever
//! sweep_interval_secs = 5
//! channel_capacity = 256        # queued outbound frames per agent
//!
//! [auth]
//! token = "shared-secret"       # optional; unset = length check only
//! min_token_length = 11
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::tunnel::SubdomainPolicy;

const DEFAULT_CONFIG_FILE: &str = "tunneld.toml";

/// Room for the JSON envelope, request id and headers around an encoded body.
const FRAME_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and request-size settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Largest request or response body relayed (default 8 MB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Directory of dashboard assets served on the apex domain.
    pub static_dir: Option<String>,
}

/// Tunnel routing and agent protocol settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Path of the agent WebSocket endpoint (default `/tunnel`).
    #[serde(default = "default_tunnel_path")]
    pub path: String,
    /// Base domain. Override with `TUNNEL_DOMAIN`.
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Scheme of advertised public URLs. Override with `TUNNEL_HTTP_SCHEME`.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Port appended to advertised public URLs. Override with `TUNNEL_PORT`.
    pub public_port: Option<u16>,
    /// Behaviour when a subdomain is claimed twice (default `overwrite`).
    #[serde(default)]
    pub subdomain_policy: SubdomainPolicy,
    /// Seconds a forwarded request may wait for its agent (default 60, 0 = no limit).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Seconds between expiry sweeps (default 5).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Outbound frames queued per agent before sends fail (default 256).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Agent authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared agent token. Override with `TUNNEL_AUTH_TOKEN`.
    pub token: Option<String>,
    /// Minimum token length when no static token is set (default 11).
    #[serde(default = "default_min_token_length")]
    pub min_token_length: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024 // 8 MB
}
fn default_tunnel_path() -> String {
    "/tunnel".to_string()
}
fn default_domain() -> String {
    "localhost".to_string()
}
fn default_scheme() -> String {
    "http".to_string()
}
fn default_request_timeout() -> u64 {
    60
}
fn default_sweep_interval() -> u64 {
    5
}
fn default_channel_capacity() -> usize {
    256
}
fn default_min_token_length() -> usize {
    11
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_bytes: default_max_body_bytes(),
            static_dir: None,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            path: default_tunnel_path(),
            domain: default_domain(),
            scheme: default_scheme(),
            public_port: None,
            subdomain_policy: SubdomainPolicy::default(),
            request_timeout_secs: default_request_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: None,
            min_token_length: default_min_token_length(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Largest agent WebSocket frame accepted. Bodies travel base64 encoded
    /// inside JSON, so a body of `max_body_bytes` needs more than that on
    /// the wire.
    pub fn max_frame_bytes(&self) -> usize {
        self.max_body_bytes
            .div_ceil(3)
            .saturating_mul(4)
            .saturating_add(FRAME_OVERHEAD_BYTES)
    }
}

impl TunnelConfig {
    /// `None` when expiry is disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    /// Public URL advertised for `subdomain`, e.g. `https://alpha.example.com:8443`.
    pub fn public_url(&self, subdomain: &str) -> String {
        let port = self
            .public_port
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        format!("{}://{subdomain}.{}{port}", self.scheme, self.domain)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `tunneld.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Env var overrides, read through `lookup` so tests need not touch the
    /// process environment.
    fn apply_env(
        &mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(listen) = lookup("TUNNEL_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(domain) = lookup("TUNNEL_DOMAIN") {
            self.tunnel.domain = domain;
        }
        if let Some(scheme) = lookup("TUNNEL_HTTP_SCHEME") {
            self.tunnel.scheme = scheme;
        }
        if let Some(port) = lookup("TUNNEL_PORT") {
            let parsed = port.parse().map_err(|_| ConfigError::Env {
                var: "TUNNEL_PORT",
                value: port.clone(),
            })?;
            self.tunnel.public_port = Some(parsed);
        }
        if let Some(token) = lookup("TUNNEL_AUTH_TOKEN") {
            self.auth.token = Some(token);
        }
        Ok(())
    }
}
