use crate::status::Status;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// One byte compression flag plus a four byte big-endian length.
pub const MESSAGE_HEADER_LEN: usize = 5;

/// Frames a single message for the wire.
pub fn encode_message(compressed: bool, payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(MESSAGE_HEADER_LEN + payload.len());
    buf.put_u8(u8::from(compressed));
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Reassembles length-prefixed messages out of DATA payloads. A single DATA
/// frame may carry any number of whole or partial messages, and one message
/// may span many frames.
#[derive(Debug)]
pub struct MessageReader {
    buffer: BytesMut,
    pending: Option<(bool, usize)>,
    max_size: usize,
}

impl MessageReader {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            pending: None,
            max_size,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next whole message, or `None` until more DATA arrives.
    pub fn next(&mut self) -> Result<Option<(bool, Bytes)>, Status> {
        if self.pending.is_none() {
            if self.buffer.len() < MESSAGE_HEADER_LEN {
                return Ok(None);
            }
            let compressed = match self.buffer.get_u8() {
                0 => false,
                1 => true,
                flag => {
                    return Err(Status::internal(format!(
                        "invalid message compression flag {flag}"
                    )))
                }
            };
            let length = self.buffer.get_u32() as usize;
            if length > self.max_size {
                return Err(Status::resource_exhausted(format!(
                    "message of {length} bytes exceeds limit of {} bytes",
                    self.max_size
                )));
            }
            self.pending = Some((compressed, length));
        }
        // unwrap: just populated above
        let (compressed, length) = self.pending.unwrap();
        if self.buffer.len() < length {
            return Ok(None);
        }
        self.pending = None;
        Ok(Some((compressed, self.buffer.split_to(length).freeze())))
    }

    /// True when no partial message is buffered. The peer half-closing while
    /// this is false means a message straddled end-of-stream.
    pub fn is_clean(&self) -> bool {
        self.pending.is_none() && self.buffer.is_empty()
    }
}
