//! Frame flag bits, RFC 7540 §6.
//!
//! | frame kind   | 0x1        | 0x4         | 0x8    | 0x20     |
//! |--------------|------------|-------------|--------|----------|
//! | DATA         | END_STREAM |             | PADDED |          |
//! | HEADERS      | END_STREAM | END_HEADERS | PADDED | PRIORITY |
//! | SETTINGS     | ACK        |             |        |          |
//! | PUSH_PROMISE |            | END_HEADERS | PADDED |          |
//! | PING         | ACK        |             |        |          |
//! | CONTINUATION |            | END_HEADERS |        |          |
//!
//! Padding and priority fields are parsed on receipt and never emitted; the
//! outbound constructors below only produce the flag shapes this engine
//! actually sends.

use bitflags::bitflags;

bitflags! {
    #[repr(transparent)]
    pub struct DataFlags: u8 {
        const END_STREAM = 0x1;
        const PADDED = 0x8;
    }

    #[repr(transparent)]
    pub struct HeadersFlags: u8 {
        const END_STREAM = 0x1;
        const END_HEADERS = 0x4;
        const PADDED = 0x8;
        const PRIORITY = 0x20;
    }

    #[repr(transparent)]
    pub struct SettingsFlags: u8 {
        const ACK = 0x1;
    }

    #[repr(transparent)]
    pub struct PushPromiseFlags: u8 {
        const END_HEADERS = 0x4;
        const PADDED = 0x8;
    }

    #[repr(transparent)]
    pub struct PingFlags: u8 {
        const ACK = 0x1;
    }

    #[repr(transparent)]
    pub struct ContinuationFlags: u8 {
        const END_HEADERS = 0x4;
    }
}

impl DataFlags {
    /// Outbound DATA is never padded; END_STREAM is the only bit we set.
    pub fn with_end_stream(end_stream: bool) -> Self {
        if end_stream {
            Self::END_STREAM
        } else {
            Self::empty()
        }
    }
}

impl HeadersFlags {
    /// The leading frame of an outbound header block. `last` is true when
    /// the whole block fits this frame and no CONTINUATION follows.
    pub fn for_block(last: bool, end_stream: bool) -> Self {
        let mut flags = Self::empty();
        if last {
            flags |= Self::END_HEADERS;
        }
        if end_stream {
            flags |= Self::END_STREAM;
        }
        flags
    }
}

impl ContinuationFlags {
    /// A CONTINUATION frame of an outbound header block.
    pub fn for_block(last: bool) -> Self {
        if last {
            Self::END_HEADERS
        } else {
            Self::empty()
        }
    }
}
