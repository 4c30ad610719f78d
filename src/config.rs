use crate::identity::Identity;
use crate::session::SessionConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the relay
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and certificate configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend session settings and the allow-list
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port shared by public clients and backends (default: 443)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Path to TLS certificate file (PEM format).
    /// A self-signed certificate is generated when unset.
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Certificate presented to backends (defaults to the public certificate)
    pub backend_tls_cert: Option<String>,

    /// Private key for `backend_tls_cert`
    pub backend_tls_key: Option<String>,

    /// Maximum time for a TLS handshake, in seconds (default: 10)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl ServerConfig {
    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn has_backend_tls_files(&self) -> bool {
        self.backend_tls_cert.is_some() && self.backend_tls_key.is_some()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            tls_cert: None,
            tls_key: None,
            backend_tls_cert: None,
            backend_tls_key: None,
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Interval between keepalive PINGs on idle backend sessions (default: 15)
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Time to wait for a keepalive PING acknowledgement (default: 15)
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    /// Deadline for the liveness check sent before registration (default: 5)
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// Time a superseded session may keep serving open streams (default: 60)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Key hashes of backends allowed to register, as lowercase hex
    #[serde(default)]
    pub allowed_backends: Vec<Identity>,
}

impl RelayConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(self.keepalive_timeout_secs),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            ping_timeout_secs: default_ping_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            allowed_backends: Vec::new(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    443
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_keepalive_interval() -> u64 {
    15
}

fn default_keepalive_timeout() -> u64 {
    15
}

fn default_ping_timeout() -> u64 {
    5
}

fn default_drain_timeout() -> u64 {
    60 // matches the relay's one-minute drain window
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let server = &self.server;
        let relay = &self.relay;

        if server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }
        if server.handshake_timeout_secs == 0 {
            errors.push("server: 'handshake_timeout_secs' must be greater than 0".to_string());
        }
        if server.tls_cert.is_some() != server.tls_key.is_some() {
            errors.push("server: 'tls_cert' and 'tls_key' must be set together".to_string());
        }
        if server.backend_tls_cert.is_some() != server.backend_tls_key.is_some() {
            errors.push("server: 'backend_tls_cert' and 'backend_tls_key' must be set together".to_string());
        }

        for (name, value) in [
            ("keepalive_interval_secs", relay.keepalive_interval_secs),
            ("keepalive_timeout_secs", relay.keepalive_timeout_secs),
            ("ping_timeout_secs", relay.ping_timeout_secs),
            ("drain_timeout_secs", relay.drain_timeout_secs),
        ] {
            if value == 0 {
                errors.push(format!("relay: '{}' must be greater than 0", name));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
