//! Hub and worker-agent configuration structures.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::infra::framing::DEFAULT_MAX_FRAME_BYTES;

/// Wire framing selection for one side of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingConfig {
    /// HTTP/1.x messages.
    #[default]
    Http,
    /// u32 big-endian length prefix.
    LengthPrefixed,
}

impl std::str::FromStr for FramingConfig {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "length_prefixed" | "length-prefixed" => Ok(Self::LengthPrefixed),
            other => Err(format!("unknown framing `{other}`")),
        }
    }
}

/// How many jobs a worker connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// One job, then the hub closes the connection.
    #[default]
    Once,
    /// Keep serving jobs until the worker disconnects or fails.
    Persistent,
}

/// Hub configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Interface both listeners bind to.
    pub bind_host: String,
    /// Public port for client requests.
    pub main_port: u16,
    /// Port workers connect to.
    pub worker_port: u16,
    /// Maximum client wait in seconds; `None` waits indefinitely.
    pub client_timeout_secs: Option<u64>,
    /// Largest frame accepted on either side.
    pub max_frame_bytes: usize,
    /// Framing on the public side.
    pub client_framing: FramingConfig,
    /// Framing on the worker side.
    pub worker_framing: FramingConfig,
    /// Jobs served per worker connection.
    pub worker_mode: WorkerMode,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            main_port: 8080,
            worker_port: 8081,
            client_timeout_secs: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            client_framing: FramingConfig::Http,
            worker_framing: FramingConfig::Http,
            worker_mode: WorkerMode::Once,
        }
    }
}

impl HubConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Describes the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.bind_host.trim().is_empty() {
            return Err("bind_host must not be empty".into());
        }
        if self.main_port != 0 && self.main_port == self.worker_port {
            return Err(format!(
                "main_port and worker_port must differ (both {})",
                self.main_port
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err("max_frame_bytes must be greater than 0".into());
        }
        if self.client_timeout_secs == Some(0) {
            return Err("client_timeout_secs must be greater than 0 when set".into());
        }
        Ok(())
    }

    /// Parse hub configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `TUNNEL_*` environment variables, loading `.env` first.
    ///
    /// Recognized: `TUNNEL_BIND_HOST`, `TUNNEL_MAIN_PORT`, `TUNNEL_WORKER_PORT`,
    /// `TUNNEL_CLIENT_TIMEOUT_SECS`, `TUNNEL_MAX_FRAME_BYTES`, `TUNNEL_WORKER_MODE`,
    /// `TUNNEL_CLIENT_FRAMING`, `TUNNEL_WORKER_FRAMING` (`http` or `length_prefixed`).
    ///
    /// # Errors
    ///
    /// A variable that fails to parse, or validation failure.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// A value that fails to parse, or validation failure.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(host) = lookup("TUNNEL_BIND_HOST") {
            cfg.bind_host = host;
        }
        if let Some(port) = lookup("TUNNEL_MAIN_PORT") {
            cfg.main_port = parse_var("TUNNEL_MAIN_PORT", &port)?;
        }
        if let Some(port) = lookup("TUNNEL_WORKER_PORT") {
            cfg.worker_port = parse_var("TUNNEL_WORKER_PORT", &port)?;
        }
        if let Some(secs) = lookup("TUNNEL_CLIENT_TIMEOUT_SECS") {
            cfg.client_timeout_secs = Some(parse_var("TUNNEL_CLIENT_TIMEOUT_SECS", &secs)?);
        }
        if let Some(max) = lookup("TUNNEL_MAX_FRAME_BYTES") {
            cfg.max_frame_bytes = parse_var("TUNNEL_MAX_FRAME_BYTES", &max)?;
        }
        if let Some(framing) = lookup("TUNNEL_CLIENT_FRAMING") {
            cfg.client_framing = parse_var("TUNNEL_CLIENT_FRAMING", &framing)?;
        }
        if let Some(framing) = lookup("TUNNEL_WORKER_FRAMING") {
            cfg.worker_framing = parse_var("TUNNEL_WORKER_FRAMING", &framing)?;
        }
        if let Some(mode) = lookup("TUNNEL_WORKER_MODE") {
            cfg.worker_mode = match mode.to_ascii_lowercase().as_str() {
                "once" => WorkerMode::Once,
                "persistent" => WorkerMode::Persistent,
                other => return Err(format!("TUNNEL_WORKER_MODE: unknown mode `{other}`")),
            };
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Address of the public listener.
    #[must_use]
    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.main_port)
    }

    /// Address of the worker listener.
    #[must_use]
    pub fn worker_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.worker_port)
    }
}

/// Worker-agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hub worker listener to dial.
    pub hub_addr: SocketAddr,
    /// Local backends requests are forwarded to.
    pub backends: Vec<SocketAddr>,
    /// Concurrent connections held open to the hub.
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Framing on the hub link; must match the hub's `worker_framing`.
    #[serde(default)]
    pub hub_framing: FramingConfig,
    /// Framing spoken by the backends.
    #[serde(default)]
    pub backend_framing: FramingConfig,
    /// Largest frame accepted.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Delay before redialling the hub after a failure, in milliseconds.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

const fn default_connections() -> usize {
    4
}

const fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

const fn default_reconnect_delay_ms() -> u64 {
    500
}

impl AgentConfig {
    /// Agent config with defaults for everything but the addresses.
    #[must_use]
    pub fn new(hub_addr: SocketAddr, backends: Vec<SocketAddr>) -> Self {
        Self {
            hub_addr,
            backends,
            connections: default_connections(),
            hub_framing: FramingConfig::Http,
            backend_framing: FramingConfig::Http,
            max_frame_bytes: default_max_frame_bytes(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Describes the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.backends.is_empty() {
            return Err("at least one backend must be configured".into());
        }
        if self.connections == 0 {
            return Err("connections must be greater than 0".into());
        }
        if self.max_frame_bytes == 0 {
            return Err("max_frame_bytes must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse agent configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| format!("{key}: invalid value `{value}`: {e}"))
}
