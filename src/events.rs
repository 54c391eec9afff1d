use crate::status::Code;
use crate::types::{ErrorType, StreamId};

/// Lifecycle notifications for external log/metric adapters. The core never
/// logs application traffic itself.
#[derive(Debug, Clone)]
pub enum Event {
    StreamStarted { stream: StreamId, path: String },
    HeadersSent { stream: StreamId },
    HeadersReceived { stream: StreamId },
    MessageSent { stream: StreamId, wire_bytes: usize },
    MessageReceived { stream: StreamId, wire_bytes: usize },
    StreamClosed { stream: StreamId, code: Code },
    GoAwaySent { last_stream: StreamId, error: ErrorType },
    GoAwayReceived { last_stream: StreamId, error: ErrorType },
}

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Default sink: drops everything.
pub struct NoopEvents;

impl EventSink for NoopEvents {
    fn on_event(&self, _event: &Event) {}
}
