//! Configuration file loading shared by the backend and the gateway.

use crate::Endpoint;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Reads and parses a YAML configuration file.
pub fn from_yaml_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
    serde_yaml::from_str(&content)
        .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
}

/// Rejects a vsock endpoint on a host without vsock support.
pub fn ensure_transport_supported(endpoint: &Endpoint) -> Result<(), ConfigError> {
    if endpoint.is_vsock() && !crate::vsock_supported() {
        return Err(ConfigError::ValidationError(format!(
            "{} requires VSOCK, which is not supported on this host; use TCP",
            endpoint
        )));
    }
    Ok(())
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode: vsock\ncid: 16\nport: 9001").unwrap();

        let endpoint: Endpoint = from_yaml_file(file.path()).unwrap();
        assert_eq!(endpoint, Endpoint::vsock(16, 9001));
    }

    #[test]
    fn test_missing_file() {
        let result = from_yaml_file::<Endpoint>("/nonexistent/vrelay.yaml");
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));
        assert!(err.to_string().contains("/nonexistent/vrelay.yaml"));
    }

    #[test]
    fn test_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode: carrier-pigeon").unwrap();

        let err = from_yaml_file::<Endpoint>(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
        assert!(err.to_string().starts_with("failed to parse config file"));
    }

    #[test]
    fn test_tcp_always_supported() {
        assert!(ensure_transport_supported(&Endpoint::tcp("127.0.0.1", 9001)).is_ok());
    }

    #[test]
    fn test_vsock_support_follows_platform() {
        let result = ensure_transport_supported(&Endpoint::vsock(16, 9001));
        assert_eq!(result.is_ok(), cfg!(target_os = "linux"));
        if let Err(err) = result {
            assert!(err.to_string().contains("use TCP"));
        }
    }

    #[test]
    fn test_validation_display() {
        let err = ConfigError::ValidationError("chunk_size must be greater than 0".to_string());
        assert_eq!(
            err.to_string(),
            "configuration validation failed: chunk_size must be greater than 0"
        );
    }
}
