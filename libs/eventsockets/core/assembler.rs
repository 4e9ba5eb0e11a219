use crate::codec::{Frame, Opcode};
use crate::error::{Result, WsError};
use crate::message::WsMessage;
use bytes::{Bytes, BytesMut};

/// Reassembles data frames into complete messages
///
/// Owned by the read loop. Control frames never reach it; they may
/// arrive between fragments and are handled by the session directly.
#[derive(Debug)]
pub struct MessageAssembler {
    max_message_size: usize,
    partial: Option<(Opcode, BytesMut)>,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            partial: None,
        }
    }

    /// Whether a fragmented message is waiting for its final frame
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Feed one data frame; returns the message once its final frame arrives
    pub fn push(&mut self, frame: Frame) -> Result<Option<WsMessage>> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if self.partial.is_some() {
                    return Err(WsError::protocol(
                        "new data frame while a fragmented message is in progress",
                    ));
                }
                self.check_size(frame.payload.len())?;

                if frame.fin {
                    return message_from_payload(frame.opcode, frame.payload).map(Some);
                }
                self.partial = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                Ok(None)
            }
            Opcode::Continuation => {
                let (opcode, mut data) = self
                    .partial
                    .take()
                    .ok_or_else(|| WsError::protocol("continuation frame without a message"))?;

                self.check_size(data.len() + frame.payload.len())?;
                data.extend_from_slice(&frame.payload);

                if frame.fin {
                    message_from_payload(opcode, data.freeze()).map(Some)
                } else {
                    self.partial = Some((opcode, data));
                    Ok(None)
                }
            }
            other => Err(WsError::protocol(format!(
                "control frame {:?} passed to message assembler",
                other
            ))),
        }
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_message_size {
            return Err(WsError::MessageTooBig(format!(
                "message of {} bytes exceeds limit of {}",
                size, self.max_message_size
            )));
        }
        Ok(())
    }
}

fn message_from_payload(opcode: Opcode, payload: Bytes) -> Result<WsMessage> {
    match opcode {
        Opcode::Text => match String::from_utf8(payload.to_vec()) {
            Ok(text) => Ok(WsMessage::Text(text)),
            Err(_) => Err(WsError::InvalidPayload(
                "text message is not valid UTF-8".into(),
            )),
        },
        _ => Ok(WsMessage::Binary(payload)),
    }
}
