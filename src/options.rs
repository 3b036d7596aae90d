use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::frame::OpCode;

/// subprotocol the pair socket type advertises
pub const PAIR_PROTOCOL: &str = "pair.sp.nanomsg.org";

/// default cap on a reassembled inbound message
pub const DEFAULT_RECV_MAX_SIZE: i64 = 1024 * 1024;

/// outbound message type: the opcode data frames are sent under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// text frames (payload must be valid UTF-8 for conformant peers)
    Text = 0x1,
    /// binary frames
    Binary = 0x2,
}

impl MsgType {
    pub(crate) fn opcode(self) -> OpCode {
        match self {
            MsgType::Text => OpCode::Text,
            MsgType::Binary => OpCode::Binary,
        }
    }
}

/// socket options observed by the transport
#[derive(Debug, Clone)]
pub(crate) struct Options {
    /// default outbound opcode
    pub msg_type: MsgType,
    /// inbound message cap in bytes; -1 is unbounded
    pub recv_max_size: i64,
    /// per-call send timeout; `None` blocks indefinitely
    pub send_timeout: Option<Duration>,
    /// per-call receive timeout; `None` blocks indefinitely
    pub recv_timeout: Option<Duration>,
    /// first reconnect backoff interval
    pub reconnect_ivl: Duration,
    /// backoff doubling cap
    pub reconnect_ivl_max: Duration,
    /// limit on the HTTP upgrade exchange
    pub handshake_timeout: Duration,
    /// grace period for the closing handshake
    pub linger: Duration,
    /// advertised subprotocol
    pub protocol: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            msg_type: MsgType::Binary,
            recv_max_size: DEFAULT_RECV_MAX_SIZE,
            send_timeout: None,
            recv_timeout: None,
            reconnect_ivl: Duration::from_millis(100),
            reconnect_ivl_max: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            linger: Duration::from_secs(1),
            protocol: PAIR_PROTOCOL.to_string(),
        }
    }
}

/// options handle shared between the socket and its endpoint tasks, so
/// changes apply to live connections
pub(crate) type SharedOptions = Arc<Mutex<Options>>;

pub(crate) fn shared(options: Options) -> SharedOptions {
    Arc::new(Mutex::new(options))
}

pub(crate) fn snapshot(options: &SharedOptions) -> Options {
    options.lock().expect("options lock").clone()
}
