use bytes::{Bytes, BytesMut};

use crate::errors::ProtocolError;
use crate::frame::{Frame, OpCode};

/// Rebuilds messages from data-phase frames.
///
/// Control frames never reach this type; the endpoint handles them. The
/// size limit is passed per frame so option changes take effect on a
/// live connection.
#[derive(Debug, Default)]
pub(crate) struct MessageAssembler {
    current: Option<(OpCode, BytesMut)>,
    utf8: Utf8Carry,
}

impl MessageAssembler {
    /// feed one data frame; `limit < 0` means unbounded
    pub fn push(
        &mut self,
        frame: Frame,
        limit: i64,
    ) -> Result<Option<(OpCode, Bytes)>, ProtocolError> {
        debug_assert!(!frame.header.opcode.is_control());
        let fin = frame.header.fin;
        match frame.header.opcode {
            OpCode::Continuation => {
                let (opcode, buf) = self
                    .current
                    .as_mut()
                    .ok_or(ProtocolError::UnexpectedContinuation)?;
                check_room(limit, buf.len(), frame.payload.len())?;
                if *opcode == OpCode::Text {
                    self.utf8.feed(&frame.payload)?;
                }
                buf.extend_from_slice(&frame.payload);
                if !fin {
                    return Ok(None);
                }
                let (opcode, buf) = self.current.take().expect("message in progress");
                if opcode == OpCode::Text {
                    self.utf8.finish()?;
                }
                Ok(Some((opcode, buf.freeze())))
            }
            opcode => {
                if self.current.is_some() {
                    return Err(ProtocolError::UnfinishedMessage(opcode));
                }
                check_room(limit, 0, frame.payload.len())?;
                if opcode == OpCode::Text {
                    self.utf8.reset();
                    self.utf8.feed(&frame.payload)?;
                }
                if fin {
                    if opcode == OpCode::Text {
                        self.utf8.finish()?;
                    }
                    return Ok(Some((opcode, frame.payload)));
                }
                self.current = Some((opcode, BytesMut::from(&frame.payload[..])));
                Ok(None)
            }
        }
    }
}

fn check_room(limit: i64, have: usize, add: usize) -> Result<(), ProtocolError> {
    if limit >= 0 && (have as u64 + add as u64) > limit as u64 {
        return Err(ProtocolError::MessageTooBig(have + add));
    }
    Ok(())
}

/// Incremental UTF-8 state: holds the bytes of an incomplete trailing
/// sequence between fragments. A sequence that is invalid on its own is
/// rejected at the fragment where it happens; one that is merely cut at
/// the fragment boundary must be completed by the end of the message.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn reset(&mut self) {
        self.pending.clear();
    }

    fn feed(&mut self, mut chunk: &[u8]) -> Result<(), ProtocolError> {
        if !self.pending.is_empty() {
            while !chunk.is_empty() {
                self.pending.push(chunk[0]);
                chunk = &chunk[1..];
                match std::str::from_utf8(&self.pending) {
                    Ok(_) => {
                        self.pending.clear();
                        break;
                    }
                    Err(e) if e.error_len().is_some() => return Err(ProtocolError::InvalidUtf8),
                    Err(_) => {}
                }
            }
            if !self.pending.is_empty() {
                // fragment exhausted inside the same codepoint
                return Ok(());
            }
        }
        match std::str::from_utf8(chunk) {
            Ok(_) => Ok(()),
            Err(e) if e.error_len().is_some() => Err(ProtocolError::InvalidUtf8),
            Err(e) => {
                self.pending.extend_from_slice(&chunk[e.valid_up_to()..]);
                Ok(())
            }
        }
    }

    fn finish(&mut self) -> Result<(), ProtocolError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            self.pending.clear();
            Err(ProtocolError::InvalidUtf8)
        }
    }
}
