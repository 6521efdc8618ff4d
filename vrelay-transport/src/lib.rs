//! # vrelay-transport
//!
//! Connection layer shared by the vrelay gateway and backend.
//!
//! This crate provides:
//! - `Endpoint`: a virtual socket `(cid, port)` or a TCP `(host, port)`
//! - `RelayListener` / `RelayStream` over either transport
//! - Chunked message reads driven by a `Framing` rule
//! - YAML configuration file loading

pub mod config;
pub mod endpoint;
pub mod io;
pub mod listener;
pub mod stream;
mod vsock;

pub use config::{ensure_transport_supported, from_yaml_file, ConfigError};
pub use endpoint::{Endpoint, PeerAddr, VMADDR_CID_ANY};
pub use io::{read_message, write_message, ReadUntil};
pub use listener::{Accept, RelayListener, ACCEPT_BACKLOG};
pub use stream::RelayStream;

/// Returns whether the vsock transport is available in this build.
pub fn vsock_supported() -> bool {
    vsock::SUPPORTED
}
