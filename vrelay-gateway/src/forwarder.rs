//! Backend round trips: enveloping, sending, reply translation.

use crate::error::TransportError;
use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, Uri};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use vrelay_protocol::{
    Encoder, Envelope, Framing, MessageBuffer, DEFAULT_CHUNK_SIZE, MAX_PAYLOAD_SIZE,
};
use vrelay_transport::{read_message, write_message, Endpoint, ReadUntil, RelayStream};

/// Default connect timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default reply timeout (5 seconds).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum read chunk size.
pub const MIN_CHUNK_SIZE: usize = 64;

/// Maximum read chunk size (1 MiB).
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Forwarder configuration.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Backend address.
    pub endpoint: Endpoint,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Time allowed for sending the envelope and receiving the whole reply.
    pub read_timeout: Duration,
    /// Wire framing.
    pub framing: Framing,
    /// Size of each socket read.
    pub chunk_size: usize,
    /// Largest reply accepted.
    pub max_reply_bytes: usize,
}

impl ForwarderConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            framing: Framing::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_reply_bytes: MAX_PAYLOAD_SIZE as usize,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self
    }

    pub fn with_max_reply_bytes(mut self, max: usize) -> Self {
        self.max_reply_bytes = max;
        self
    }
}

/// A backend reply, ready to hand back to the HTTP caller.
#[derive(Debug, Clone, PartialEq)]
pub enum TranslatedReply {
    /// The reply was a JSON document.
    Json(Value),
    /// Anything else, passed through byte for byte.
    Raw(Bytes),
}

impl TranslatedReply {
    pub fn content_type(&self) -> &'static str {
        match self {
            TranslatedReply::Json(_) => "application/json",
            TranslatedReply::Raw(_) => "text/plain; charset=utf-8",
        }
    }

    /// Response body bytes.
    pub fn into_body(self) -> Bytes {
        match self {
            TranslatedReply::Json(value) => match serde_json::to_vec(&value) {
                Ok(body) => Bytes::from(body),
                Err(e) => {
                    tracing::error!("Failed to serialize reply: {}", e);
                    Bytes::new()
                }
            },
            TranslatedReply::Raw(bytes) => bytes,
        }
    }
}

/// Forwards requests to the backend, one connection per request.
#[derive(Debug, Clone)]
pub struct Forwarder {
    config: ForwarderConfig,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Captures an HTTP request as an envelope.
    ///
    /// Header names are sent in canonical form (`X-Test`), repeated headers
    /// are joined with `", "`. The body is only carried for POST, PUT and
    /// PATCH.
    pub fn build_envelope(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Envelope {
        let mut captured = HashMap::with_capacity(headers.keys_len());
        for name in headers.keys() {
            let value = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(", ");
            captured.insert(canonical_header_name(name.as_str()), value);
        }

        let envelope = Envelope::new(method.as_str(), uri.path()).with_headers(captured);

        if carries_body(method) {
            envelope.with_body(String::from_utf8_lossy(body).into_owned())
        } else {
            envelope
        }
    }

    /// Sends `envelope` over a fresh connection and returns the raw reply.
    pub async fn send_and_receive(&self, envelope: &Envelope) -> Result<Bytes, TransportError> {
        let config = &self.config;
        let request = Encoder::encode_envelope(envelope, config.framing)?;

        let mut stream = tokio::time::timeout(
            config.connect_timeout,
            RelayStream::connect(&config.endpoint),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            stage: "connect",
            timeout: config.connect_timeout,
        })?
        .map_err(|source| TransportError::Connect {
            endpoint: config.endpoint.clone(),
            source,
        })?;
        tracing::debug!("Connected to {}", config.endpoint);

        let exchange = async {
            write_message(&mut stream, &request).await?;
            // The backend may wait for end of stream before replying
            stream.shutdown().await?;

            let buffer =
                MessageBuffer::new(config.framing).with_max_size(config.max_reply_bytes);
            let reply =
                read_message(&mut stream, buffer, config.chunk_size, ReadUntil::Close).await?;
            Ok::<_, TransportError>(reply)
        };

        let reply = tokio::time::timeout(config.read_timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout {
                stage: "reply",
                timeout: config.read_timeout,
            })??;

        stream.close().await;
        tracing::debug!("Received {} byte reply", reply.len());
        Ok(reply)
    }

    /// Interprets a backend reply. Never fails.
    pub fn translate_reply(reply: Bytes) -> TranslatedReply {
        match serde_json::from_slice::<Value>(&reply) {
            Ok(value) => TranslatedReply::Json(value),
            Err(_) => TranslatedReply::Raw(reply),
        }
    }

    /// Sends `envelope` and translates the reply.
    pub async fn forward(&self, envelope: &Envelope) -> Result<TranslatedReply, TransportError> {
        let reply = self.send_and_receive(envelope).await?;
        Ok(Self::translate_reply(reply))
    }
}

fn carries_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

/// `x-forwarded-for` -> `X-Forwarded-For`.
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
