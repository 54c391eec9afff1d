use bytes::Bytes;
use num_derive::{FromPrimitive, ToPrimitive};
use percent_encoding::{percent_decode, utf8_percent_encode, AsciiSet, CONTROLS};

/// `grpc-message` keeps %x20-%x7E literal except `%` itself; everything else
/// is percent-coded.
const GRPC_MESSAGE_ENCODE_SET: &AsciiSet = &CONTROLS.add(b'%');

/// https://grpc.io/docs/guides/status-codes/
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Codes outside the closed enumeration decode to `Unknown`.
    pub fn from_wire(value: u32) -> Self {
        u8::try_from(value)
            .ok()
            .and_then(num_traits::FromPrimitive::from_u8)
            .unwrap_or(Code::Unknown)
    }
}

/// The terminal outcome of an RPC, delivered in trailers on the wire.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{code:?}: {message}")]
pub struct Status {
    code: Code,
    message: String,
    details: Option<Bytes>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: Code, message: impl Into<String>, details: Bytes) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&Bytes> {
        self.details.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// `grpc-message` value; `None` when there is nothing to send.
    pub fn encoded_message(&self) -> Option<String> {
        if self.message.is_empty() {
            None
        } else {
            Some(utf8_percent_encode(&self.message, GRPC_MESSAGE_ENCODE_SET).to_string())
        }
    }

    pub fn decode_message(raw: &[u8]) -> String {
        percent_decode(raw).decode_utf8_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_from_wire() {
        assert_eq!(Code::from_wire(0), Code::Ok);
        assert_eq!(Code::from_wire(4), Code::DeadlineExceeded);
        assert_eq!(Code::from_wire(16), Code::Unauthenticated);
        assert_eq!(Code::from_wire(17), Code::Unknown);
        assert_eq!(Code::from_wire(u32::MAX), Code::Unknown);
    }

    #[test]
    fn message_round_trip() {
        let status = Status::internal("ouch: 100% broken\nnewline");
        let encoded = status.encoded_message().unwrap();
        assert!(!encoded.contains('\n'));
        assert!(encoded.contains("%25"));
        assert_eq!(
            Status::decode_message(encoded.as_bytes()),
            "ouch: 100% broken\nnewline"
        );
    }

    #[test]
    fn message_keeps_printable_ascii() {
        let status = Status::invalid_argument("plain message (ok)");
        assert_eq!(status.encoded_message().unwrap(), "plain message (ok)");
    }

    #[test]
    fn utf8_message_round_trip() {
        let status = Status::unknown("héllo wörld");
        let encoded = status.encoded_message().unwrap();
        assert!(encoded.is_ascii());
        assert_eq!(Status::decode_message(encoded.as_bytes()), "héllo wörld");
    }

    #[test]
    fn empty_message_elided() {
        assert!(Status::ok().encoded_message().is_none());
    }
}
