//! # vrelay-protocol
//!
//! Wire protocol for vrelay, the HTTP-to-backend request relay.
//!
//! This crate provides:
//! - Envelope (forwarded request) and Reply (backend response) JSON documents
//! - Framing modes deciding when an inbound message is complete
//! - Optional binary framing with length prefix and CRC32C validation
//! - Protocol error types

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Completion, Encoder, Framing, MessageBuffer};
pub use error::ProtocolError;
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{Envelope, Reply};

/// Protocol version carried in length-prefixed frames.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port the backend listens on (vsock or TCP).
pub const DEFAULT_BACKEND_PORT: u16 = 9001;

/// Size of a single socket read.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Maximum message size accepted by either side (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Closing delimiter of a JSON object, used by heuristic completion detection.
pub const MESSAGE_TERMINATOR: u8 = b'}';
