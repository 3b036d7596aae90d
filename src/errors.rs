use thiserror::Error;

use crate::frame::OpCode;

/// errors surfaced through the socket API
#[derive(Debug, Error)]
pub enum WsError {
    /// the address string was rejected by the parser
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    /// the named local interface does not exist
    #[error("no such device `{0}`")]
    NoSuchDevice(String),
    /// an option or call argument is out of range
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// no completion within the configured send/receive timeout
    #[error("operation timed out")]
    Timeout,
    /// the socket or endpoint is closed
    #[error("socket closed")]
    Closed,
    /// a non-blocking operation could not make progress
    #[error("operation would block")]
    WouldBlock,
    /// the HTTP upgrade exchange failed
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    /// transport-level failure
    #[error("io error {0}")]
    Io(#[from] std::io::Error),
    /// the peer violated the framing protocol; `close_code` is what goes
    /// back in the Close frame
    #[error("{error}")]
    Protocol {
        /// close status sent to the peer
        close_code: u16,
        /// the wire-level violation
        error: ProtocolError,
    },
}

/// wire-level violations detected while decoding or reassembling frames
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved header bits are not zero ({0:#x})")]
    NonZeroReservedBits(u8),
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooBig(usize),
    #[error("payload length has the most significant bit set")]
    InvalidPayloadLen,
    #[error("unmasked frame received from client")]
    UnmaskedFrame,
    #[error("masked frame received from server")]
    MaskedFrame,
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("new {0:?} frame while a fragmented message is in progress")]
    UnfinishedMessage(OpCode),
    #[error("message of {0} bytes exceeds the receive limit")]
    MessageTooBig(usize),
    #[error("invalid utf-8 in text payload")]
    InvalidUtf8,
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    #[error("close frame with a one byte payload")]
    InvalidClosePayload,
}

impl ProtocolError {
    /// close status sent to the peer when this violation is detected
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::InvalidUtf8 => crate::frame::close_code::INVALID_DATA,
            ProtocolError::MessageTooBig(_) => crate::frame::close_code::TOO_BIG,
            _ => crate::frame::close_code::PROTOCOL,
        }
    }
}

impl From<ProtocolError> for WsError {
    fn from(error: ProtocolError) -> Self {
        WsError::Protocol {
            close_code: error.close_code(),
            error,
        }
    }
}
