//! Message encoding and completion detection.
//!
//! A connection carries exactly one message in each direction. How the
//! receiver decides that the inbound message is complete is selected by
//! [`Framing`]; both ends of a connection must agree on it.

use crate::error::ProtocolError;
use crate::frame::{Frame, FRAME_HEADER_SIZE};
use crate::message::{Envelope, Reply};
use crate::{MAX_PAYLOAD_SIZE, MESSAGE_TERMINATOR};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rule used by a receiver to judge an inbound message complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Stop as soon as a read chunk contains the JSON closing delimiter `}`,
    /// or on end of stream.
    ///
    /// Known limitation: a `}` inside a string value (or a nested object
    /// closing before the outer one) ends the read early and the message is
    /// truncated at the end of the chunk that held it. Kept for legacy peers.
    Heuristic,
    /// Read until the peer closes its write side.
    #[default]
    Close,
    /// Every message is wrapped in a length-prefixed [`Frame`].
    LengthPrefixed,
}

impl Framing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framing::Heuristic => "heuristic",
            Framing::Close => "close",
            Framing::LengthPrefixed => "length_prefixed",
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "heuristic" | "legacy" => Ok(Framing::Heuristic),
            "close" | "eof" => Ok(Framing::Close),
            "length_prefixed" | "length-prefixed" | "framed" => Ok(Framing::LengthPrefixed),
            other => Err(format!(
                "unknown framing '{}' (expected heuristic, close or length_prefixed)",
                other
            )),
        }
    }
}

/// Result of feeding a chunk into a [`MessageBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Keep reading.
    Incomplete,
    /// The message is complete under the buffer's framing.
    Complete,
}

/// Accumulates the chunks of one inbound message.
pub struct MessageBuffer {
    framing: Framing,
    buffer: BytesMut,
    max_size: usize,
}

impl MessageBuffer {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: BytesMut::with_capacity(crate::DEFAULT_CHUNK_SIZE),
            max_size: MAX_PAYLOAD_SIZE as usize + FRAME_HEADER_SIZE,
        }
    }

    /// Caps the number of bytes the buffer accepts.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Appends a chunk and reports whether the message is now complete.
    pub fn extend(&mut self, chunk: &[u8]) -> Result<Completion, ProtocolError> {
        let size = self.buffer.len() + chunk.len();
        if size > self.max_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_size,
            });
        }
        self.buffer.extend_from_slice(chunk);

        let completion = match self.framing {
            // Earlier chunks were already scanned, so scanning the new chunk
            // is the same as scanning everything read so far.
            Framing::Heuristic if chunk.contains(&MESSAGE_TERMINATOR) => Completion::Complete,
            Framing::Heuristic | Framing::Close => Completion::Incomplete,
            Framing::LengthPrefixed => match Frame::encoded_len(&self.buffer)? {
                Some(total) if self.buffer.len() >= total => Completion::Complete,
                _ => Completion::Incomplete,
            },
        };
        Ok(completion)
    }

    /// Number of bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Consumes the buffer and returns the message payload.
    ///
    /// Under `LengthPrefixed` the frame is validated and unwrapped; a partial
    /// frame is an error. An empty buffer yields an empty payload in every
    /// mode (the peer sent nothing).
    pub fn finish(self) -> Result<Bytes, ProtocolError> {
        match self.framing {
            Framing::Heuristic | Framing::Close => Ok(self.buffer.freeze()),
            Framing::LengthPrefixed => {
                if self.buffer.is_empty() {
                    return Ok(Bytes::new());
                }
                let mut buf = self.buffer;
                match Frame::decode(&mut buf)? {
                    Some(frame) => Ok(frame.payload),
                    None => {
                        let needed = match Frame::encoded_len(&buf)? {
                            Some(total) => total - buf.len(),
                            None => FRAME_HEADER_SIZE - buf.len(),
                        };
                        Err(ProtocolError::IncompleteFrame { needed })
                    }
                }
            }
        }
    }
}

/// Encodes outbound messages for a given framing.
pub struct Encoder;

impl Encoder {
    /// Encodes an envelope as a JSON document.
    pub fn encode_envelope(envelope: &Envelope, framing: Framing) -> Result<Bytes, ProtocolError> {
        Self::encode_payload(envelope.to_json()?, framing)
    }

    /// Encodes a reply as a JSON document.
    pub fn encode_reply(reply: &Reply, framing: Framing) -> Result<Bytes, ProtocolError> {
        Self::encode_payload(reply.to_json()?, framing)
    }

    /// Wraps an already-serialized payload for the wire.
    pub fn encode_payload(payload: Vec<u8>, framing: Framing) -> Result<Bytes, ProtocolError> {
        match framing {
            Framing::LengthPrefixed => Ok(Frame::new(Bytes::from(payload)).encode()?.freeze()),
            Framing::Heuristic | Framing::Close => {
                if payload.len() > MAX_PAYLOAD_SIZE as usize {
                    return Err(ProtocolError::MessageTooLarge {
                        size: payload.len(),
                        max: MAX_PAYLOAD_SIZE as usize,
                    });
                }
                Ok(Bytes::from(payload))
            }
        }
    }
}
