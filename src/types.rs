use bytes::Bytes;
use num_derive::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;

// Safety: value is a const, that can't be zero
pub const U31_MAX: NonZeroU32 = unsafe { NonZeroU32::new_unchecked(u32::MAX >> 1) };

pub type StreamId = u32;
pub type NonZeroStreamId = std::num::NonZeroU32;

/// A decoded header list, in wire order. Names are lowercase on the wire.
pub type RawHeaders = Vec<(Bytes, Bytes)>;

#[derive(thiserror::Error, Debug)]
pub enum FrameDecodeError {
    #[error("Payload is shorter than expected")]
    PayloadTooShort,
    #[error("Payload length {0} is invalid for this frame type")]
    PayloadLength(usize),
    #[error("Unexpected 0 stream ID")]
    ZeroStreamId,
    #[error("Unexpected non-0 stream ID")]
    NonZeroStreamId,
    #[error("Unexpected 0 window increment")]
    ZeroWindowIncrement,
    #[error("Padding exceeds payload")]
    InvalidPadding,
    #[error("SETTINGS ACK with a non-empty payload")]
    AckWithPayload,
}

impl FrameDecodeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::PayloadTooShort | Self::PayloadLength(_) | Self::AckWithPayload => {
                ErrorType::FrameSizeError
            }
            Self::ZeroStreamId
            | Self::NonZeroStreamId
            | Self::ZeroWindowIncrement
            | Self::InvalidPadding => ErrorType::ProtocolError,
        }
    }
}

/// An HTTP/2-level failure, scoped to a stream or to the whole connection.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum H2Error {
    #[error("connection error {0:?}: {1}")]
    Connection(ErrorType, String),
    #[error("stream {0} error {1:?}")]
    Stream(StreamId, ErrorType),
}

impl H2Error {
    pub fn connection(error: ErrorType, message: impl Into<String>) -> Self {
        Self::Connection(error, message.into())
    }

    pub fn stream(stream: StreamId, error: ErrorType) -> Self {
        Self::Stream(stream, error)
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Connection(error, _) | Self::Stream(_, error) => *error,
        }
    }
}

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[non_exhaustive]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorType {
    /// The associated condition is not a result of an error. For example, a GOAWAY might include this code to indicate graceful shutdown of a connection.
    NoError = 0x0,
    /// The endpoint detected an unspecific protocol error. This error is for use when a more specific error code is not available.
    ProtocolError = 0x1,
    /// The endpoint encountered an unexpected internal error.
    InternalError = 0x2,
    /// The endpoint detected that its peer violated the flow-control protocol.
    FlowControlError = 0x3,
    /// The endpoint sent a SETTINGS frame but did not receive a response in a timely manner.
    SettingsTimeout = 0x4,
    /// The endpoint received a frame after a stream was half-closed.
    StreamClosed = 0x5,
    /// The endpoint received a frame with an invalid size.
    FrameSizeError = 0x6,
    /// The endpoint refused the stream prior to performing any application processing.
    RefusedStream = 0x7,
    /// Used by the endpoint to indicate that the stream is no longer needed.
    Cancel = 0x8,
    /// The endpoint is unable to maintain the header compression context for the connection.
    CompressionError = 0x9,
    /// The connection established in response to a CONNECT request was reset or abnormally closed.
    ConnectError = 0xa,
    /// The endpoint detected that its peer is exhibiting a behavior that might be generating excessive load.
    EnhanceYourCalm = 0xb,
    /// The underlying transport has properties that do not meet minimum security requirements.
    InadequateSecurity = 0xc,
    /// The endpoint requires that HTTP/1.1 be used instead of HTTP/2.
    Http11Required = 0xd,
}

impl ErrorType {
    /// Unknown or unsupported error codes must not trigger special behavior
    /// and may be treated as INTERNAL_ERROR.
    pub fn from_wire(value: u32) -> Self {
        num_traits::FromPrimitive::from_u32(value).unwrap_or(ErrorType::InternalError)
    }
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
#[non_exhaustive]
pub enum SettingsParameter {
    /// Maximum size of the header compression table used to decode header blocks, in octets. The initial value is 4,096 octets.
    HeaderTableSize = 0x1,
    /// Whether server push is permitted. The initial value is 1; any value other than 0 or 1 is a connection error of type PROTOCOL_ERROR.
    EnablePush = 0x2,
    /// Maximum number of concurrent streams that the sender will allow.
    MaxConcurrentStreams = 0x3,
    /// The sender's initial window size (in octets) for stream-level flow control. The initial value is 2^16-1 (65,535) octets.
    InitialWindowSize = 0x4,
    /// Size of the largest frame payload that the sender is willing to receive, in octets. Must stay within [2^14, 2^24-1].
    MaxFrameSize = 0x5,
    /// Advisory maximum size of header list that the sender is prepared to accept, in octets.
    MaxHeaderListSize = 0x6,
}
