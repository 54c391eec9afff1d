use crate::{flags::*, types::*};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const FRAME_HEADER_LEN: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_ALLOWED_FRAME_SIZE: u32 = (1 << 24) - 1;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// https://httpwg.org/specs/rfc7540.html#ConnectionHeader
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

#[derive(thiserror::Error, Debug)]
pub enum FrameReadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] FrameDecodeError),
    #[error("frame of {0} bytes exceeds SETTINGS_MAX_FRAME_SIZE")]
    Oversize(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub raw_type: u8,
    pub raw_flags: u8,
    pub stream: StreamId,
}

impl FrameHeader {
    pub fn parse(bytes: [u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            length: u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]),
            raw_type: bytes[3],
            raw_flags: bytes[4],
            // the high bit is reserved and ignored on receipt
            stream: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & (u32::MAX >> 1),
        }
    }
}

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream: NonZeroStreamId,
        flags: DataFlags,
        data: Bytes,
    },
    Headers {
        stream: NonZeroStreamId,
        flags: HeadersFlags,
        fragment: Bytes,
    },
    /// Parsed for validity, otherwise ignored.
    Priority { stream: NonZeroStreamId },
    ResetStream {
        stream: NonZeroStreamId,
        error: ErrorType,
    },
    Settings {
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
    },
    /// Never sent; receipt is rejected at the connection layer.
    PushPromise {
        stream: NonZeroStreamId,
        flags: PushPromiseFlags,
        promised: StreamId,
        fragment: Bytes,
    },
    Ping { flags: PingFlags, data: [u8; 8] },
    GoAway {
        last_stream: StreamId,
        error: ErrorType,
        debug: Bytes,
    },
    WindowUpdate {
        stream: StreamId,
        increment: NonZeroU32,
    },
    Continuation {
        stream: NonZeroStreamId,
        flags: ContinuationFlags,
        fragment: Bytes,
    },
}

fn require_stream(header: &FrameHeader) -> Result<NonZeroStreamId, FrameDecodeError> {
    NonZeroStreamId::new(header.stream).ok_or(FrameDecodeError::ZeroStreamId)
}

fn require_connection(header: &FrameHeader) -> Result<(), FrameDecodeError> {
    if header.stream == 0 {
        Ok(())
    } else {
        Err(FrameDecodeError::NonZeroStreamId)
    }
}

/// Strips the Pad Length octet and trailing padding.
fn unpad(payload: Bytes) -> Result<Bytes, FrameDecodeError> {
    let mut payload = payload;
    if payload.is_empty() {
        return Err(FrameDecodeError::PayloadTooShort);
    }
    let pad = payload.get_u8() as usize;
    if pad >= payload.len() + 1 {
        return Err(FrameDecodeError::InvalidPadding);
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

impl Frame {
    /// Parses a frame payload. Unknown frame types decode to `None` and are
    /// ignored, as required by the RFC.
    pub fn parse(header: FrameHeader, mut payload: Bytes) -> Result<Option<Self>, FrameDecodeError> {
        let ty = match FrameType::from_u8(header.raw_type) {
            Some(ty) => ty,
            None => return Ok(None),
        };
        Ok(Some(match ty {
            FrameType::Data => {
                let stream = require_stream(&header)?;
                let flags = DataFlags::from_bits_truncate(header.raw_flags);
                let data = if flags.contains(DataFlags::PADDED) {
                    unpad(payload)?
                } else {
                    payload
                };
                Self::Data { stream, flags, data }
            }
            FrameType::Headers => {
                let stream = require_stream(&header)?;
                let flags = HeadersFlags::from_bits_truncate(header.raw_flags);
                let mut fragment = if flags.contains(HeadersFlags::PADDED) {
                    unpad(payload)?
                } else {
                    payload
                };
                if flags.contains(HeadersFlags::PRIORITY) {
                    // exclusive bit + dependency + weight, skipped
                    if fragment.len() < 5 {
                        return Err(FrameDecodeError::PayloadTooShort);
                    }
                    fragment.advance(5);
                }
                Self::Headers {
                    stream,
                    flags,
                    fragment,
                }
            }
            FrameType::Priority => {
                let stream = require_stream(&header)?;
                if payload.len() != 5 {
                    return Err(FrameDecodeError::PayloadLength(payload.len()));
                }
                Self::Priority { stream }
            }
            FrameType::ResetStream => {
                let stream = require_stream(&header)?;
                if payload.len() != 4 {
                    return Err(FrameDecodeError::PayloadLength(payload.len()));
                }
                Self::ResetStream {
                    stream,
                    error: ErrorType::from_wire(payload.get_u32()),
                }
            }
            FrameType::Settings => {
                require_connection(&header)?;
                let flags = SettingsFlags::from_bits_truncate(header.raw_flags);
                if flags.contains(SettingsFlags::ACK) && !payload.is_empty() {
                    return Err(FrameDecodeError::AckWithPayload);
                }
                if payload.len() % 6 != 0 {
                    return Err(FrameDecodeError::PayloadLength(payload.len()));
                }
                let mut params = Vec::with_capacity(payload.len() / 6);
                while payload.has_remaining() {
                    let key = payload.get_u16();
                    let value = payload.get_u32();
                    // unknown settings are ignored
                    if let Some(param) = SettingsParameter::from_u16(key) {
                        params.push((param, value));
                    }
                }
                Self::Settings { flags, params }
            }
            FrameType::PushPromise => {
                let stream = require_stream(&header)?;
                let flags = PushPromiseFlags::from_bits_truncate(header.raw_flags);
                let mut fragment = if flags.contains(PushPromiseFlags::PADDED) {
                    unpad(payload)?
                } else {
                    payload
                };
                if fragment.len() < 4 {
                    return Err(FrameDecodeError::PayloadTooShort);
                }
                let promised = fragment.get_u32() & (u32::MAX >> 1);
                Self::PushPromise {
                    stream,
                    flags,
                    promised,
                    fragment,
                }
            }
            FrameType::Ping => {
                require_connection(&header)?;
                if payload.len() != 8 {
                    return Err(FrameDecodeError::PayloadLength(payload.len()));
                }
                let mut data = [0u8; 8];
                payload.copy_to_slice(&mut data);
                Self::Ping {
                    flags: PingFlags::from_bits_truncate(header.raw_flags),
                    data,
                }
            }
            FrameType::GoAway => {
                require_connection(&header)?;
                if payload.len() < 8 {
                    return Err(FrameDecodeError::PayloadTooShort);
                }
                let last_stream = payload.get_u32() & (u32::MAX >> 1);
                let error = ErrorType::from_wire(payload.get_u32());
                Self::GoAway {
                    last_stream,
                    error,
                    debug: payload,
                }
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(FrameDecodeError::PayloadLength(payload.len()));
                }
                let increment = NonZeroU32::new(payload.get_u32() & (u32::MAX >> 1))
                    .ok_or(FrameDecodeError::ZeroWindowIncrement)?;
                Self::WindowUpdate {
                    stream: header.stream,
                    increment,
                }
            }
            FrameType::Continuation => {
                let stream = require_stream(&header)?;
                Self::Continuation {
                    stream,
                    flags: ContinuationFlags::from_bits_truncate(header.raw_flags),
                    fragment: payload,
                }
            }
        }))
    }

    /// Reads one frame, skipping over unknown frame types.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_frame_size: u32,
    ) -> Result<Self, FrameReadError> {
        loop {
            let mut head = [0u8; FRAME_HEADER_LEN];
            reader.read_exact(&mut head).await?;
            let header = FrameHeader::parse(head);
            if header.length > max_frame_size {
                return Err(FrameReadError::Oversize(header.length));
            }
            let mut payload = vec![0u8; header.length as usize];
            reader.read_exact(&mut payload).await?;
            if let Some(frame) = Self::parse(header, payload.into())? {
                return Ok(frame);
            }
        }
    }

    pub fn ty(&self) -> FrameType {
        match self {
            Self::Data { .. } => FrameType::Data,
            Self::Headers { .. } => FrameType::Headers,
            Self::Priority { .. } => FrameType::Priority,
            Self::ResetStream { .. } => FrameType::ResetStream,
            Self::Settings { .. } => FrameType::Settings,
            Self::PushPromise { .. } => FrameType::PushPromise,
            Self::Ping { .. } => FrameType::Ping,
            Self::GoAway { .. } => FrameType::GoAway,
            Self::WindowUpdate { .. } => FrameType::WindowUpdate,
            Self::Continuation { .. } => FrameType::Continuation,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::Data { stream, .. }
            | Self::Headers { stream, .. }
            | Self::Priority { stream, .. }
            | Self::ResetStream { stream, .. }
            | Self::PushPromise { stream, .. }
            | Self::Continuation { stream, .. } => stream.get(),
            Self::WindowUpdate { stream, .. } => *stream,
            Self::Settings { .. } | Self::Ping { .. } | Self::GoAway { .. } => 0,
        }
    }

    fn raw_flags(&self) -> u8 {
        match self {
            Self::Data { flags, .. } => flags.bits(),
            Self::Headers { flags, .. } => flags.bits(),
            Self::Settings { flags, .. } => flags.bits(),
            Self::PushPromise { flags, .. } => flags.bits(),
            Self::Ping { flags, .. } => flags.bits(),
            Self::Continuation { flags, .. } => flags.bits(),
            _ => 0,
        }
    }

    /// Serialises the frame. Padding and priority fields are never emitted.
    pub fn encode(&self, buf: &mut BytesMut) {
        let payload_len = match self {
            Self::Data { data, .. } => data.len(),
            Self::Headers { fragment, .. } | Self::Continuation { fragment, .. } => fragment.len(),
            Self::Priority { .. } => 5,
            Self::ResetStream { .. } | Self::WindowUpdate { .. } => 4,
            Self::Settings { params, .. } => params.len() * 6,
            Self::PushPromise { fragment, .. } => fragment.len() + 4,
            Self::Ping { .. } => 8,
            Self::GoAway { debug, .. } => debug.len() + 8,
        };
        buf.reserve(FRAME_HEADER_LEN + payload_len);
        buf.put_slice(&(payload_len as u32).to_be_bytes()[1..]);
        // unwrap: FrameType is repr(u8)
        buf.put_u8(self.ty().to_u8().unwrap());
        buf.put_u8(self.raw_flags());
        buf.put_u32(self.stream_id());
        match self {
            Self::Data { data, .. } => buf.put_slice(data),
            Self::Headers { fragment, .. } | Self::Continuation { fragment, .. } => {
                buf.put_slice(fragment);
            }
            Self::Priority { .. } => {
                buf.put_u32(0);
                buf.put_u8(0);
            }
            Self::ResetStream { error, .. } => {
                // unwrap: ErrorType is repr(u32)
                buf.put_u32(error.to_u32().unwrap());
            }
            Self::Settings { params, .. } => {
                for (key, value) in params {
                    // unwrap: SettingsParameter is repr(u16)
                    buf.put_u16(key.to_u16().unwrap());
                    buf.put_u32(*value);
                }
            }
            Self::PushPromise {
                promised, fragment, ..
            } => {
                buf.put_u32(*promised);
                buf.put_slice(fragment);
            }
            Self::Ping { data, .. } => buf.put_slice(data),
            Self::GoAway {
                last_stream,
                error,
                debug,
            } => {
                buf.put_u32(*last_stream);
                // unwrap: ErrorType is repr(u32)
                buf.put_u32(error.to_u32().unwrap());
                buf.put_slice(debug);
            }
            Self::WindowUpdate { increment, .. } => buf.put_u32(increment.get()),
        }
    }
}
