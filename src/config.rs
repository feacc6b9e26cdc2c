//! Configuration management

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Default frontend port trusted regardless of host
pub const DEFAULT_FRONTEND_PORT: u16 = 2727;

/// Default API port
pub const DEFAULT_PORT: u16 = 3001;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl Environment {
    fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "development" | "dev" => Environment::Development,
            _ => Environment::Production,
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address (default: 127.0.0.1)
    pub bind_addr: IpAddr,

    /// API port
    pub port: u16,

    /// Deployment environment
    pub environment: Environment,

    /// Frontend port whose origins are always accepted
    pub frontend_port: u16,

    /// Directory for the vault key and encrypted credentials
    pub data_dir: PathBuf,

    /// JSON file holding the trusted-origin collection
    pub origins_file: PathBuf,

    /// Skip the credential retrieval limiter (development only)
    pub skip_rate_limit: bool,

    /// Accept any origin (development only)
    pub allow_any_origin_in_dev: bool,

    /// Key rate limits on `X-Forwarded-For` / `X-Real-IP` (behind a reverse proxy only)
    pub trust_proxy: bool,

    /// Enable request logging
    pub log_requests: bool,

    /// Automation sidecar endpoint for credential retrieval
    pub automation_url: Option<String>,

    /// Derive the vault key from this passphrase instead of storing one
    pub vault_passphrase: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            environment: Environment::Production,
            frontend_port: DEFAULT_FRONTEND_PORT,
            origins_file: data_dir.join("config").join("allowed-origins.json"),
            data_dir,
            skip_rate_limit: false,
            allow_any_origin_in_dev: false,
            trust_proxy: false,
            log_requests: true,
            automation_url: None,
            vault_passphrase: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let flag = |key: &str| {
            lookup(key)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false)
        };

        if let Some(addr) = lookup("BIND_ADDR").and_then(|v| v.parse().ok()) {
            config.bind_addr = addr;
        }

        if let Some(port) = lookup("PORT").and_then(|v| v.parse().ok()) {
            config.port = port;
        }

        if let Some(env) = lookup("FLOW_ENV").or_else(|| lookup("NODE_ENV")) {
            config.environment = Environment::parse(&env);
        }

        if let Some(port) = lookup("FRONTEND_PORT").and_then(|v| v.parse().ok()) {
            config.frontend_port = port;
        }

        if let Some(dir) = lookup("FLOW_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
            config.origins_file = config.data_dir.join("config").join("allowed-origins.json");
        }

        if let Some(file) = lookup("ORIGINS_FILE") {
            config.origins_file = PathBuf::from(file);
        }

        config.skip_rate_limit = flag("SKIP_RATE_LIMIT");
        config.allow_any_origin_in_dev = flag("ALLOW_ANY_ORIGIN_IN_DEV");
        config.trust_proxy = flag("TRUST_PROXY");

        if let Some(val) = lookup("LOG_REQUESTS") {
            config.log_requests = val == "true" || val == "1";
        }

        config.automation_url = lookup("AUTOMATION_URL").filter(|v| !v.trim().is_empty());
        config.vault_passphrase = lookup("VAULT_PASSPHRASE").filter(|v| !v.is_empty());

        if !config.environment.is_development()
            && (config.skip_rate_limit || config.allow_any_origin_in_dev)
        {
            tracing::warn!("Development-only overrides ignored outside development");
        }

        config
    }

    /// Whether the credential retrieval limiter is bypassed
    pub fn rate_limit_skipped(&self) -> bool {
        self.environment.is_development() && self.skip_rate_limit
    }

    /// Whether the origin gate admits every origin
    pub fn origin_gate_open(&self) -> bool {
        self.environment.is_development() && self.allow_any_origin_in_dev
    }

    /// Get the socket address
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Check if bound to localhost only
    pub fn is_localhost(&self) -> bool {
        self.bind_addr.is_loopback()
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flow")
}
