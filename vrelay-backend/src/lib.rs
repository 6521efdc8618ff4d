//! # vrelay-backend
//!
//! Backend side of vrelay, running inside the isolated environment.
//!
//! This crate provides:
//! - Listener loop over vsock or TCP (sequential or one task per connection)
//! - Inbound message reads bounded by framing, size and timeout
//! - Envelope decoding with raw-echo fallback
//! - The `RequestHandler` seam and the default path-keyed handler

pub mod config;
pub mod error;
pub mod handler;
pub mod server;

pub use config::{Config, ConfigError, ConnectionConfig, Scheduling};
pub use error::{BackendError, BusinessError};
pub use handler::{Outcome, Responder, RequestHandler, RouteHandler};
pub use server::{Server, ServerConfig, ServerStats};
