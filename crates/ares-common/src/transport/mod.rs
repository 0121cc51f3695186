//! Ares Transport Layer
//!
//! This module provides the codec and the framed TCP transport used by both
//! the client channels and the provider server.
//!
//! # Architecture
//!
//! - **Transport**: TCP, one long-lived connection per pooled channel
//! - **Codec**: JSON serialization of `CallRequest` / `CallResponse`
//! - **Wire Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//!
//! # Components
//!
//! - **[`JsonCodec`]**: Encode/decode call messages
//! - **[`TcpTransport`]**: Connect plus frame read/write helpers
//!
//! # Message Size Limits
//!
//! Frames larger than 100 MB are rejected on both read and write.

pub mod codec;
pub mod tcp;

pub use codec::JsonCodec;
pub use tcp::{TcpTransport, DEFAULT_CONNECT_TIMEOUT, MAX_MESSAGE_SIZE};

#[cfg(test)]
mod tests;
