//! Backend addresses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Wildcard context id: listen on every CID the host owns.
pub const VMADDR_CID_ANY: u32 = u32::MAX;

/// Where the backend listens, or where the gateway connects to.
///
/// In YAML:
///
/// ```yaml
/// mode: vsock
/// cid: 16
/// port: 9001
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Endpoint {
    /// Virtual socket channel identified by context id and port.
    Vsock { cid: u32, port: u32 },
    /// TCP, used for local development.
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    pub fn vsock(cid: u32, port: u32) -> Self {
        Endpoint::Vsock { cid, port }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn is_vsock(&self) -> bool {
        matches!(self, Endpoint::Vsock { .. })
    }

    /// Short transport name, used in logs.
    pub fn transport(&self) -> &'static str {
        match self {
            Endpoint::Vsock { .. } => "VSOCK",
            Endpoint::Tcp { .. } => "TCP",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Vsock { cid, port } => write!(f, "vsock://{}:{}", cid, port),
            Endpoint::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{}]:{}", host, port)
            }
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    /// Parses `vsock://<cid>:<port>` or `tcp://<host>:<port>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| format!("endpoint '{}' is missing a vsock:// or tcp:// prefix", s))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| format!("endpoint '{}' is missing a port", s))?;

        match scheme.to_lowercase().as_str() {
            "vsock" => {
                let cid = host
                    .parse()
                    .map_err(|_| format!("invalid vsock CID '{}'", host))?;
                let port = port
                    .parse()
                    .map_err(|_| format!("invalid vsock port '{}'", port))?;
                Ok(Endpoint::Vsock { cid, port })
            }
            "tcp" => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(format!("endpoint '{}' is missing a host", s));
                }
                let port = port
                    .parse()
                    .map_err(|_| format!("invalid TCP port '{}'", port))?;
                Ok(Endpoint::tcp(host, port))
            }
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Address of the peer of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    Vsock { cid: u32, port: u32 },
    Tcp(SocketAddr),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Vsock { cid, port } => write!(f, "CID: {}, Port: {}", cid, port),
            PeerAddr::Tcp(addr) => write!(f, "{}", addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Endpoint::vsock(16, 9001).to_string(), "vsock://16:9001");
        assert_eq!(Endpoint::tcp("localhost", 9001).to_string(), "tcp://localhost:9001");
        assert_eq!(Endpoint::tcp("::1", 9001).to_string(), "tcp://[::1]:9001");
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "vsock://3:5005".parse::<Endpoint>().unwrap(),
            Endpoint::vsock(3, 5005)
        );
        assert_eq!(
            "tcp://127.0.0.1:9001".parse::<Endpoint>().unwrap(),
            Endpoint::tcp("127.0.0.1", 9001)
        );
        assert_eq!(
            "tcp://[::1]:9001".parse::<Endpoint>().unwrap(),
            Endpoint::tcp("::1", 9001)
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("localhost:9001".parse::<Endpoint>().is_err());
        assert!("tcp://localhost".parse::<Endpoint>().is_err());
        assert!("vsock://abc:9001".parse::<Endpoint>().is_err());
        assert!("tcp://host:99999".parse::<Endpoint>().is_err());
        assert!("udp://host:53".parse::<Endpoint>().is_err());
        assert!("tcp://:9001".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_display_parse_roundtrip() {
        for endpoint in [
            Endpoint::vsock(VMADDR_CID_ANY, 9001),
            Endpoint::tcp("enclave.local", 7000),
            Endpoint::tcp("::1", 1),
        ] {
            assert_eq!(endpoint.to_string().parse::<Endpoint>().unwrap(), endpoint);
        }
    }

    #[test]
    fn test_yaml_tagged() {
        let endpoint: Endpoint = serde_yaml::from_str("mode: vsock\ncid: 16\nport: 9001\n").unwrap();
        assert_eq!(endpoint, Endpoint::vsock(16, 9001));

        let endpoint: Endpoint =
            serde_yaml::from_str("mode: tcp\nhost: localhost\nport: 9001\n").unwrap();
        assert_eq!(endpoint, Endpoint::tcp("localhost", 9001));

        let json = serde_json::to_value(Endpoint::tcp("localhost", 1)).unwrap();
        assert_eq!(json["mode"], "tcp");
    }

    #[test]
    fn test_peer_display() {
        let peer = PeerAddr::Vsock { cid: 3, port: 1234 };
        assert_eq!(peer.to_string(), "CID: 3, Port: 1234");
        let peer = PeerAddr::Tcp("127.0.0.1:5000".parse().unwrap());
        assert_eq!(peer.to_string(), "127.0.0.1:5000");
    }
}
