//! Pair messaging sockets over a WebSocket (RFC 6455) transport.
//!
//! A [`PairSocket`] exchanges discrete, length-delimited messages with
//! one peer. Connections are carried over WebSocket framing: the
//! transport performs the HTTP/1.1 upgrade, masks client traffic,
//! answers pings, reassembles fragmented messages and runs the closing
//! handshake, while the socket surface stays a plain send/receive pair
//! with timeouts, size limits and automatic reconnection.
//!
//! ```no_run
//! use ws_pair::PairSocket;
//!
//! # async fn demo() -> Result<(), ws_pair::WsError> {
//! let server = PairSocket::new();
//! server.bind("ws://127.0.0.1:5555")?;
//!
//! let client = PairSocket::new();
//! client.connect("ws://127.0.0.1:5555")?;
//!
//! client.send("hello").await?;
//! let message = server.recv().await?;
//! assert_eq!(&message.data[..], b"hello");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

use bytes::Bytes;

/// address parsing
pub mod addr;
/// frame encoder/decoder
pub mod codec;
/// error definitions
pub mod errors;
/// websocket transport unit
pub mod frame;
/// HTTP/1.1 upgrade exchange
pub mod handshake;
/// socket options
pub mod options;
/// the user-facing socket surface
pub mod socket;

mod connector;
mod endpoint;
mod listener;
mod reassembly;

pub use addr::{AddrKind, Host, WsAddr};
pub use errors::{ProtocolError, WsError};
pub use frame::{close_code, Frame, FrameHeader, OpCode};
pub use options::{MsgType, PAIR_PROTOCOL};
pub use socket::{EndpointId, MsgMeta, PairSocket};

/// one reassembled application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// opcode the message arrived under
    ///
    /// see all codes in [overview](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2)
    pub code: OpCode,
    /// payload bytes
    pub data: Bytes,
}

impl Message {
    /// payload as text, when it is valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}
