use crate::compression::CompressionRegistry;
use crate::frame::{DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use std::time::Duration;

/// Tunables shared by clients and servers. The defaults interoperate with
/// stock gRPC peers.
#[derive(Clone)]
pub struct Config {
    /// SETTINGS_INITIAL_WINDOW_SIZE advertised to the peer.
    pub initial_window_size: u32,
    /// SETTINGS_MAX_FRAME_SIZE advertised to the peer.
    pub max_frame_size: u32,
    /// SETTINGS_MAX_CONCURRENT_STREAMS advertised to the peer (server).
    pub max_concurrent_streams: u32,
    /// SETTINGS_MAX_HEADER_LIST_SIZE advertised and enforced on receipt.
    pub max_header_list_size: u32,
    /// Inbound messages above this many bytes fail RESOURCE_EXHAUSTED.
    pub max_recv_message_size: usize,
    /// Compression applied to outbound messages, when the peer accepts it.
    pub send_encoding: Option<String>,
    pub compression: CompressionRegistry,
    /// Whether non-Status handler failures leak their message to the wire.
    pub expose_unknown_errors: bool,
    /// How long graceful shutdown waits before cancelling leftover streams.
    pub grace_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_streams: 128,
            max_header_list_size: 16_384,
            max_recv_message_size: 4 * 1024 * 1024,
            send_encoding: None,
            compression: CompressionRegistry::default(),
            expose_unknown_errors: false,
            grace_period: Duration::from_secs(10),
        }
    }
}
