//! Backend configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via VRELAY_BACKEND_CONFIG or --config)
//! 3. Environment variables
//! 4. Command-line flags (applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use vrelay_protocol::{Framing, DEFAULT_BACKEND_PORT, DEFAULT_CHUNK_SIZE, MAX_PAYLOAD_SIZE};
use vrelay_transport::{ensure_transport_supported, from_yaml_file, Endpoint, VMADDR_CID_ANY};

pub use vrelay_transport::ConfigError;

/// Backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where to listen.
    pub listen: Endpoint,
    /// Per-connection settings.
    pub connection: ConnectionConfig,
    /// Name used in the `server` tag of every reply.
    pub server_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: Endpoint::vsock(VMADDR_CID_ANY, DEFAULT_BACKEND_PORT as u32),
            connection: ConnectionConfig::default(),
            server_name: "enclave".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("VRELAY_BACKEND_CONFIG") {
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
        if let Ok(listen) = std::env::var("VRELAY_BACKEND_LISTEN") {
            match listen.parse() {
                Ok(endpoint) => self.listen = endpoint,
                Err(e) => tracing::warn!("Ignoring VRELAY_BACKEND_LISTEN: {}", e),
            }
        }

        if let Ok(port) = std::env::var("VRELAY_BACKEND_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.set_port(port);
            }
        }

        if let Ok(name) = std::env::var("VRELAY_BACKEND_NAME") {
            if !name.is_empty() {
                self.server_name = name;
            }
        }

        self.connection.apply_env_overrides();
    }

    /// Replaces the listening port, keeping the transport.
    pub fn set_port(&mut self, new_port: u16) {
        match &mut self.listen {
            Endpoint::Vsock { port, .. } => *port = new_port as u32,
            Endpoint::Tcp { port, .. } => *port = new_port,
        }
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "server_name must not be empty".to_string(),
            ));
        }
        ensure_transport_supported(&self.listen)?;
        self.connection.validate()
    }
}

/// How accepted connections are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduling {
    /// One connection at a time, handled inside the accept loop.
    #[default]
    Sequential,
    /// One task per accepted connection.
    Concurrent,
}

/// Per-connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How the end of an inbound envelope is detected.
    pub framing: Framing,
    /// Size of each socket read.
    pub chunk_size: usize,
    /// Time allowed to receive a whole envelope, in seconds.
    pub read_timeout_secs: u64,
    /// Largest envelope accepted, in bytes.
    pub max_message_bytes: usize,
    /// Scheduling of accepted connections.
    pub scheduling: Scheduling,
    /// Connections handled at once under concurrent scheduling.
    pub max_connections: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_timeout_secs: 30,
            max_message_bytes: MAX_PAYLOAD_SIZE as usize,
            scheduling: Scheduling::default(),
            max_connections: 64,
        }
    }
}

impl ConnectionConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(framing) = std::env::var("VRELAY_FRAMING") {
            match framing.parse() {
                Ok(f) => self.framing = f,
                Err(e) => tracing::warn!("Ignoring VRELAY_FRAMING: {}", e),
            }
        }

        if let Ok(size) = std::env::var("VRELAY_BACKEND_CHUNK_SIZE") {
            if let Ok(n) = size.parse() {
                self.chunk_size = n;
            }
        }

        if let Ok(timeout) = std::env::var("VRELAY_BACKEND_READ_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.read_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("VRELAY_BACKEND_MAX_MESSAGE_BYTES") {
            if let Ok(n) = max.parse() {
                self.max_message_bytes = n;
            }
        }

        if let Ok(scheduling) = std::env::var("VRELAY_BACKEND_SCHEDULING") {
            self.scheduling = match scheduling.to_lowercase().as_str() {
                "concurrent" | "task_per_connection" => Scheduling::Concurrent,
                _ => Scheduling::Sequential,
            };
        }

        if let Ok(max) = std::env::var("VRELAY_BACKEND_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }

    /// Returns the read timeout as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "connection.chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.read_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connection.read_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "connection.max_message_bytes must be greater than 0".to_string(),
            ));
        }
        if self.scheduling == Scheduling::Concurrent && self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "connection.max_connections must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen, Endpoint::vsock(VMADDR_CID_ANY, 9001));
        assert_eq!(config.server_name, "enclave");
        assert_eq!(config.connection.chunk_size, 1024);
        assert_eq!(config.connection.framing, Framing::Close);
        assert_eq!(config.connection.scheduling, Scheduling::Sequential);
        assert_eq!(config.connection.read_timeout(), Duration::from_secs(30));
        assert_eq!(config.validate().is_ok(), vrelay_transport::vsock_supported());
    }

    #[test]
    fn test_set_port_keeps_transport() {
        let mut config = Config::default();
        config.set_port(7000);
        assert_eq!(config.listen, Endpoint::vsock(VMADDR_CID_ANY, 7000));

        config.listen = Endpoint::tcp("0.0.0.0", 9001);
        config.set_port(7001);
        assert_eq!(config.listen, Endpoint::tcp("0.0.0.0", 7001));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listen:\n  mode: tcp\n  host: 127.0.0.1\n  port: 9100\nconnection:\n  framing: heuristic\n  scheduling: concurrent\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.listen, Endpoint::tcp("127.0.0.1", 9100));
        assert_eq!(config.connection.framing, Framing::Heuristic);
        assert_eq!(config.connection.scheduling, Scheduling::Concurrent);
        // Unspecified fields keep defaults
        assert_eq!(config.connection.chunk_size, 1024);
        assert_eq!(config.server_name, "enclave");
    }

    #[test]
    fn test_from_missing_file() {
        let result = Config::from_file("/nonexistent/vrelay-backend.yaml");
        assert!(matches!(result, Err(ConfigError::IoError(..))));
    }

    #[test]
    fn test_from_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen:\n  mode: carrier-pigeon\n").unwrap();
        let result = Config::from_file(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(..))));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.connection.chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.connection.read_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server_name.clear();
        assert!(config.validate().is_err());
    }
}
