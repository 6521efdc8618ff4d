//! # vrelay-gateway
//!
//! HTTP front end for vrelay.
//!
//! This crate provides:
//! - An HTTP/1 server with a local `/health` route
//! - Request enveloping and one backend round trip per request
//! - Reply translation (JSON documents or raw passthrough)

pub mod config;
pub mod error;
pub mod forwarder;
pub mod http;

pub use config::{BackendConfig, Config, ConfigError, HttpConfig, Transport};
pub use error::{GatewayError, TransportError};
pub use forwarder::{Forwarder, ForwarderConfig, TranslatedReply};
pub use http::{Gateway, GatewayStats, Router};
