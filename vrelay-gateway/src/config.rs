//! Gateway configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via VRELAY_GATEWAY_CONFIG or --config)
//! 3. Environment variables
//! 4. Command-line flags (applied by the binary)

use crate::forwarder::ForwarderConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use vrelay_protocol::{Framing, DEFAULT_BACKEND_PORT, DEFAULT_CHUNK_SIZE, MAX_PAYLOAD_SIZE};
use vrelay_transport::{ensure_transport_supported, from_yaml_file, Endpoint};

pub use vrelay_transport::ConfigError;

/// Gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Public HTTP listener.
    pub http: HttpConfig,
    /// How to reach the backend.
    pub backend: BackendConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("VRELAY_GATEWAY_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        from_yaml_file(path)
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("VRELAY_GATEWAY_BIND") {
            if let Ok(addr) = addr.parse() {
                self.http.bind_addr = addr;
            }
        }

        if let Ok(port) = std::env::var("VRELAY_GATEWAY_HTTP_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.http.bind_addr.set_port(port);
            }
        }

        if let Ok(name) = std::env::var("VRELAY_GATEWAY_NAME") {
            if !name.is_empty() {
                self.http.server_name = name;
            }
        }

        if let Ok(transport) = std::env::var("VRELAY_GATEWAY_TRANSPORT") {
            match transport.to_lowercase().as_str() {
                "tcp" => self.backend.transport = Transport::Tcp,
                "vsock" => self.backend.transport = Transport::Vsock,
                other => tracing::warn!(
                    "Ignoring VRELAY_GATEWAY_TRANSPORT: unknown transport '{}'",
                    other
                ),
            }
        }

        if let Ok(cid) = std::env::var("VRELAY_ENCLAVE_CID") {
            if let Ok(cid) = cid.parse() {
                self.backend.cid = Some(cid);
            }
        }

        if let Ok(host) = std::env::var("VRELAY_ENCLAVE_HOST") {
            self.backend.host = host;
        }

        if let Ok(port) = std::env::var("VRELAY_ENCLAVE_PORT") {
            if let Ok(port) = port.parse() {
                self.backend.port = port;
            }
        }

        if let Ok(framing) = std::env::var("VRELAY_FRAMING") {
            match framing.parse() {
                Ok(f) => self.backend.framing = f,
                Err(e) => tracing::warn!("Ignoring VRELAY_FRAMING: {}", e),
            }
        }

        if let Ok(timeout) = std::env::var("VRELAY_GATEWAY_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.backend.connect_timeout_secs = secs;
                self.backend.read_timeout_secs = secs;
            }
        }
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.server_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "http.server_name must not be empty".to_string(),
            ));
        }
        if self.http.max_body_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "http.max_body_bytes must be greater than 0".to_string(),
            ));
        }
        ensure_transport_supported(&self.backend.endpoint()?)?;
        if self.backend.connect_timeout_secs == 0 || self.backend.read_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "backend timeouts must be greater than 0".to_string(),
            ));
        }
        if self.backend.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "backend.chunk_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the forwarder settings.
    pub fn forwarder_config(&self) -> Result<ForwarderConfig, ConfigError> {
        Ok(ForwarderConfig::new(self.backend.endpoint()?)
            .with_connect_timeout(self.backend.connect_timeout())
            .with_read_timeout(self.backend.read_timeout())
            .with_framing(self.backend.framing)
            .with_chunk_size(self.backend.chunk_size)
            .with_max_reply_bytes(self.backend.max_reply_bytes))
    }
}

/// Public HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Largest request body forwarded.
    pub max_body_bytes: usize,
    /// Name reported by `/health` and in error bodies.
    pub server_name: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            max_body_bytes: 1024 * 1024,
            server_name: "server1".to_string(),
        }
    }
}

/// Backend transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Vsock,
    Tcp,
}

/// Backend connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub transport: Transport,
    /// Enclave context id; required for vsock.
    pub cid: Option<u32>,
    /// Backend host for TCP.
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub framing: Framing,
    pub chunk_size: usize,
    pub max_reply_bytes: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            cid: None,
            host: "localhost".to_string(),
            port: DEFAULT_BACKEND_PORT,
            connect_timeout_secs: 5,
            read_timeout_secs: 5,
            framing: Framing::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_reply_bytes: MAX_PAYLOAD_SIZE as usize,
        }
    }
}

impl BackendConfig {
    /// Resolves the backend endpoint. Vsock needs a CID.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        match self.transport {
            Transport::Tcp => Ok(Endpoint::tcp(self.host.clone(), self.port)),
            Transport::Vsock => match self.cid {
                Some(cid) => Ok(Endpoint::vsock(cid, self.port as u32)),
                None => Err(ConfigError::ValidationError(
                    "--enclave-cid is required for VSOCK mode".to_string(),
                )),
            },
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}
