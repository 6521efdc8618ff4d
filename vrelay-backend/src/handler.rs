//! Request handling: envelope decoding and reply construction.

use crate::error::BusinessError;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use vrelay_protocol::{Envelope, Reply, MAX_PAYLOAD_SIZE};

/// Produces a reply for a decoded envelope.
///
/// Implementations are shared between connections and must not keep
/// per-request state.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, envelope: &Envelope) -> Result<Reply, BusinessError>;
}

/// The built-in routes served by the enclave.
#[derive(Debug, Clone)]
pub struct RouteHandler {
    server_name: String,
}

impl RouteHandler {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
        }
    }

    fn timestamp() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

impl RequestHandler for RouteHandler {
    fn handle(&self, envelope: &Envelope) -> Result<Reply, BusinessError> {
        tracing::info!(
            "Received {} request for {}",
            envelope.method(),
            envelope.path()
        );

        let reply = match envelope.path() {
            "/" => Reply::new(&self.server_name)
                .with("message", "Hello from Enclave!")
                .with("timestamp", Self::timestamp())
                .with("request_method", envelope.method()),
            "/echo" => {
                let headers: serde_json::Map<String, Value> = envelope
                    .headers()
                    .iter()
                    .map(|(name, value)| (name.clone(), Value::String(value.clone())))
                    .collect();
                Reply::new(&self.server_name)
                    .with("echo", envelope.body().map(str::to_string))
                    .with("headers_received", Value::Object(headers))
            }
            path => Reply::new(&self.server_name)
                .with("message", format!("Path {} processed by Enclave", path))
                .with("timestamp", Self::timestamp()),
        };

        Ok(reply)
    }
}

/// What [`Responder::respond`] did with its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Decoded as an envelope and answered by the handler.
    Decoded,
    /// Not JSON; answered with a plain-text echo of the input.
    Fallback,
    /// JSON, but no reply could be built; answered with an error reply.
    Failed,
}

/// Turns raw inbound bytes into reply bytes. Never fails and never panics.
#[derive(Clone)]
pub struct Responder {
    handler: Arc<dyn RequestHandler>,
    server_name: String,
    max_reply_bytes: usize,
}

impl Responder {
    pub fn new(handler: Arc<dyn RequestHandler>, server_name: impl Into<String>) -> Self {
        Self {
            handler,
            server_name: server_name.into(),
            max_reply_bytes: MAX_PAYLOAD_SIZE as usize,
        }
    }

    /// Caps the size of any reply. Longer echoes are cut short; longer
    /// handler replies are replaced by an error reply.
    pub fn with_max_reply_bytes(mut self, max: usize) -> Self {
        self.max_reply_bytes = max;
        self
    }

    /// Responder serving the built-in routes.
    pub fn with_routes(server_name: impl Into<String>) -> Self {
        let server_name = server_name.into();
        Self::new(Arc::new(RouteHandler::new(server_name.clone())), server_name)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Decodes `input` and produces the bytes to send back.
    pub fn respond(&self, input: &[u8]) -> (Outcome, Vec<u8>) {
        let value: Value = match serde_json::from_slice(input) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Request is not JSON ({}), echoing raw input", e);
                return (Outcome::Fallback, self.fallback(input));
            }
        };

        let result = self.dispatch(value).and_then(|reply| {
            let bytes = self.serialize(&reply);
            if bytes.len() > self.max_reply_bytes {
                return Err(BusinessError::ReplyTooLarge {
                    size: bytes.len(),
                    max: self.max_reply_bytes,
                });
            }
            Ok(bytes)
        });

        match result {
            Ok(bytes) => (Outcome::Decoded, bytes),
            Err(e) => {
                tracing::warn!("Failed to build reply: {}", e);
                let reply = Reply::error(&self.server_name, e.to_string());
                (Outcome::Failed, self.serialize(&reply))
            }
        }
    }

    fn dispatch(&self, value: Value) -> Result<Reply, BusinessError> {
        let envelope = Envelope::from_value(value)?;
        let handler = &self.handler;

        match catch_unwind(AssertUnwindSafe(|| handler.handle(&envelope))) {
            Ok(result) => result,
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(BusinessError::Panicked(message))
            }
        }
    }

    /// `"Enclave received: <input>"`, truncated on a char boundary to fit
    /// `max_reply_bytes`.
    fn fallback(&self, input: &[u8]) -> Vec<u8> {
        let mut text = format!(
            "{} received: {}",
            capitalize(&self.server_name),
            String::from_utf8_lossy(input)
        );
        if text.len() > self.max_reply_bytes {
            let mut end = self.max_reply_bytes;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            tracing::warn!("Echo truncated from {} to {} bytes", text.len(), end);
            text.truncate(end);
        }
        text.into_bytes()
    }

    fn serialize(&self, reply: &Reply) -> Vec<u8> {
        match reply.to_json() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to serialize reply: {}", e);
                Vec::new()
            }
        }
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
