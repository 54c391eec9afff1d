use crate::{frame::DEFAULT_INITIAL_WINDOW_SIZE, status::Status, types::*};
use bytes::Bytes;
use log::trace;
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};

/// https://httpwg.org/specs/rfc7540.html#StreamStates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Inbound events handed to the stream's owning task, in wire order.
#[derive(Debug)]
pub enum StreamEvent {
    Headers { headers: RawHeaders, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
    Reset { error: ErrorType },
    /// The connection died or was told to abandon this stream.
    Closed { status: Status },
}

/// A queued outbound DATA chunk awaiting flow-control credit. `done` is
/// completed once the final byte reaches the wire.
#[derive(Debug)]
pub struct PendingData {
    pub data: Bytes,
    pub end_stream: bool,
    pub done: Option<oneshot::Sender<Result<(), Status>>>,
}

#[derive(Debug)]
pub struct Stream {
    pub id: NonZeroStreamId,
    state: StreamState,
    /// Peer-granted credit for outbound DATA. Goes negative when the peer
    /// shrinks SETTINGS_INITIAL_WINDOW_SIZE.
    pub send_window: i64,
    /// Credit we granted to the peer and have not yet seen consumed.
    pub recv_window: i64,
    /// Bytes consumed by the application since the last WINDOW_UPDATE.
    pub recv_consumed: u32,
    pub pending_send: VecDeque<PendingData>,
    pub events: mpsc::UnboundedSender<StreamEvent>,
    pub reset_sent: bool,
}

impl Stream {
    pub fn new(
        id: NonZeroStreamId,
        send_window: i64,
        recv_window: i64,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            send_window,
            recv_window,
            recv_consumed: 0,
            pending_send: VecDeque::new(),
            events,
            reset_sent: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// True while the peer may still send DATA or trailers to us.
    pub fn remote_open(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// True while we may still send DATA or trailers.
    pub fn local_open(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// https://httpwg.org/specs/rfc7540.html#StreamStates
    ///
    /// Walks the state machine for one frame. `recv` is true for frames
    /// arriving from the peer, false for frames we are about to send.
    /// Header blocks only reach this point whole (the reader reassembles
    /// CONTINUATION, the writer emits atomically), so HEADERS here always
    /// implies END_HEADERS. Receiving a frame in an illegal state is a
    /// stream error, except DATA on a half-closed(remote) stream, which is
    /// a connection error.
    pub fn transition_state(
        &mut self,
        recv: bool,
        ty: FrameType,
        end_stream: bool,
    ) -> Result<(), H2Error> {
        let send = !recv;
        let original_state = self.state;

        if matches!(ty, FrameType::ResetStream) {
            if self.state == StreamState::Idle {
                return Err(H2Error::connection(
                    ErrorType::ProtocolError,
                    "RST_STREAM on an idle stream",
                ));
            }
            self.state = StreamState::Closed;
        } else {
            let h = matches!(ty, FrameType::Headers);
            let es = end_stream;

            if recv {
                self.check_recv(ty)?;
            }

            if self.state == StreamState::Idle && h {
                self.state = StreamState::Open;
            }

            if self.state == StreamState::ReservedLocal && send && h {
                self.state = StreamState::HalfClosedRemote;
            }

            if self.state == StreamState::ReservedRemote && recv && h {
                self.state = StreamState::HalfClosedLocal;
            }

            if self.state == StreamState::Open && send && es {
                self.state = StreamState::HalfClosedLocal;
            } else if self.state == StreamState::Open && recv && es {
                self.state = StreamState::HalfClosedRemote;
            } else if self.state == StreamState::HalfClosedRemote && send && es {
                self.state = StreamState::Closed;
            } else if self.state == StreamState::HalfClosedLocal && recv && es {
                self.state = StreamState::Closed;
            }
        }

        if self.state != original_state {
            trace!(
                "stream {} {:?} -> {:?}",
                self.id,
                original_state,
                self.state
            );
        }

        Ok(())
    }

    fn check_recv(&self, ty: FrameType) -> Result<(), H2Error> {
        // WINDOW_UPDATE and PRIORITY are valid in any non-idle state and
        // never reach this path.
        match self.state {
            StreamState::Idle => match ty {
                FrameType::Headers => Ok(()),
                _ => Err(H2Error::connection(
                    ErrorType::ProtocolError,
                    format!("{ty:?} on an idle stream"),
                )),
            },
            StreamState::Open | StreamState::HalfClosedLocal => Ok(()),
            StreamState::HalfClosedRemote | StreamState::Closed => match ty {
                FrameType::Data if self.state == StreamState::HalfClosedRemote => Err(
                    H2Error::connection(ErrorType::StreamClosed, "DATA on a half-closed stream"),
                ),
                _ => Err(H2Error::stream(self.id.get(), ErrorType::ProtocolError)),
            },
            StreamState::ReservedLocal | StreamState::ReservedRemote => {
                Err(H2Error::stream(self.id.get(), ErrorType::ProtocolError))
            }
        }
    }

    /// Delivers an inbound event to the owning task; the queue is unbounded
    /// because inbound DATA is already bounded by the receive window.
    pub fn deliver(&self, event: StreamEvent) {
        // the owner may have dropped its receiver mid-stream
        self.events.send(event).ok();
    }

    /// Fails every queued send and delivers a terminal event.
    pub fn abort(&mut self, status: Status) {
        for pending in self.pending_send.drain(..) {
            if let Some(done) = pending.done {
                done.send(Err(status.clone())).ok();
            }
        }
        self.deliver(StreamEvent::Closed { status });
        self.state = StreamState::Closed;
    }
}

/// How a peer's RST_STREAM code surfaces as an RPC outcome.
pub(crate) fn status_from_reset(error: ErrorType) -> Status {
    match error {
        ErrorType::Cancel => Status::cancelled("stream reset by peer"),
        ErrorType::NoError => Status::cancelled("stream closed by peer"),
        ErrorType::RefusedStream | ErrorType::EnhanceYourCalm => {
            Status::unavailable(format!("stream refused by peer: {error:?}"))
        }
        other => Status::internal(format!("stream reset by peer: {other:?}")),
    }
}

/// Allocates stream identifiers and owns the live stream table for one
/// connection. Only the connection task touches it.
pub struct StreamCoordinator {
    streams: std::collections::HashMap<NonZeroStreamId, Stream>,
    next_local: u64,
    pub highest_remote: StreamId,
    pub highest_local: StreamId,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE as currently applied.
    pub initial_send_window: i64,
    /// Our SETTINGS_INITIAL_WINDOW_SIZE, granted to the peer per stream.
    pub initial_recv_window: i64,
}

impl StreamCoordinator {
    pub fn new(local_is_client: bool, initial_recv_window: u32) -> Self {
        Self {
            streams: std::collections::HashMap::new(),
            next_local: if local_is_client { 1 } else { 2 },
            highest_remote: 0,
            highest_local: 0,
            initial_send_window: i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
            initial_recv_window: i64::from(initial_recv_window),
        }
    }

    pub fn get_mut(&mut self, id: NonZeroStreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn with_stream<T>(
        &mut self,
        id: NonZeroStreamId,
        f: impl FnOnce(&mut Stream) -> T,
    ) -> Option<T> {
        self.streams.get_mut(&id).map(f)
    }

    /// Opens a locally initiated stream. Identifiers grow monotonically and
    /// never reappear; exhausting the 31-bit space is a connection-level
    /// failure that forces a fresh connection.
    pub fn open_local(
        &mut self,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<NonZeroStreamId, Status> {
        if self.next_local > u64::from(U31_MAX.get()) {
            return Err(Status::unavailable("stream identifiers exhausted"));
        }
        // unwrap: starts at 1 or 2 and only grows
        let id = NonZeroStreamId::new(self.next_local as u32).unwrap();
        self.next_local += 2;
        self.highest_local = id.get();
        self.streams.insert(
            id,
            Stream::new(id, self.initial_send_window, self.initial_recv_window, events),
        );
        Ok(id)
    }

    /// Registers a peer-initiated stream. The identifier must be new and of
    /// the peer's parity.
    pub fn open_remote(
        &mut self,
        id: NonZeroStreamId,
        local_is_client: bool,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<&mut Stream, H2Error> {
        // a peer-initiated stream must not share our parity
        let local_parity_odd = local_is_client;
        if (id.get() % 2 == 1) == local_parity_odd {
            return Err(H2Error::connection(
                ErrorType::ProtocolError,
                "peer used a stream identifier of the wrong parity",
            ));
        }
        if id.get() <= self.highest_remote {
            return Err(H2Error::connection(
                ErrorType::ProtocolError,
                "peer reused a stream identifier",
            ));
        }
        self.highest_remote = id.get();
        Ok(self
            .streams
            .entry(id)
            .or_insert_with(|| {
                Stream::new(id, self.initial_send_window, self.initial_recv_window, events)
            }))
    }

    pub fn remove(&mut self, id: NonZeroStreamId) -> Option<Stream> {
        self.streams.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn ids(&self) -> Vec<NonZeroStreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    /// SETTINGS_INITIAL_WINDOW_SIZE applies retroactively to every open
    /// stream by signed delta.
    pub fn apply_send_window_delta(&mut self, new_initial: u32) {
        let delta = i64::from(new_initial) - self.initial_send_window;
        self.initial_send_window = i64::from(new_initial);
        for stream in self.streams.values_mut() {
            stream.send_window += delta;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> (Stream, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Stream::new(NonZeroStreamId::new(1).unwrap(), 65_535, 65_535, tx),
            rx,
        )
    }

    #[test]
    fn request_response_lifecycle() {
        let (mut s, _rx) = stream();
        // client view: send request headers, send body, receive reply
        s.transition_state(false, FrameType::Headers, false).unwrap();
        assert_eq!(s.state(), StreamState::Open);
        s.transition_state(false, FrameType::Data, true).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedLocal);
        s.transition_state(true, FrameType::Headers, false).unwrap();
        s.transition_state(true, FrameType::Data, false).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedLocal);
        s.transition_state(true, FrameType::Headers, true).unwrap();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn reset_closes_from_any_live_state() {
        let (mut s, _rx) = stream();
        s.transition_state(true, FrameType::Headers, false).unwrap();
        assert_eq!(s.state(), StreamState::Open);
        s.transition_state(true, FrameType::ResetStream, false).unwrap();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn reset_on_idle_is_connection_error() {
        let (mut s, _rx) = stream();
        let err = s
            .transition_state(true, FrameType::ResetStream, false)
            .unwrap_err();
        assert!(matches!(err, H2Error::Connection(ErrorType::ProtocolError, _)));
    }

    #[test]
    fn data_on_idle_is_connection_error() {
        let (mut s, _rx) = stream();
        let err = s.transition_state(true, FrameType::Data, false).unwrap_err();
        assert!(matches!(err, H2Error::Connection(ErrorType::ProtocolError, _)));
    }

    #[test]
    fn data_after_peer_half_close_is_connection_error() {
        let (mut s, _rx) = stream();
        s.transition_state(true, FrameType::Headers, true).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedRemote);
        let err = s.transition_state(true, FrameType::Data, false).unwrap_err();
        assert!(matches!(err, H2Error::Connection(ErrorType::StreamClosed, _)));
    }

    #[test]
    fn headers_after_peer_half_close_is_stream_error() {
        let (mut s, _rx) = stream();
        s.transition_state(true, FrameType::Headers, true).unwrap();
        let err = s
            .transition_state(true, FrameType::Headers, false)
            .unwrap_err();
        assert!(matches!(err, H2Error::Stream(1, ErrorType::ProtocolError)));
    }

    #[test]
    fn coordinator_allocates_odd_ids_for_client() {
        let mut streams = StreamCoordinator::new(true, 65_535);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(streams.open_local(tx.clone()).unwrap().get(), 1);
        assert_eq!(streams.open_local(tx).unwrap().get(), 3);
    }

    #[test]
    fn coordinator_rejects_reused_remote_id() {
        let mut streams = StreamCoordinator::new(false, 65_535);
        let (tx, _rx) = mpsc::unbounded_channel();
        streams
            .open_remote(NonZeroStreamId::new(5).unwrap(), false, tx.clone())
            .unwrap();
        assert!(streams
            .open_remote(NonZeroStreamId::new(3).unwrap(), false, tx)
            .is_err());
    }

    #[test]
    fn coordinator_rejects_wrong_parity() {
        let mut streams = StreamCoordinator::new(false, 65_535);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(streams
            .open_remote(NonZeroStreamId::new(2).unwrap(), false, tx)
            .is_err());
    }

    #[test]
    fn window_delta_applies_to_open_streams() {
        let mut streams = StreamCoordinator::new(true, 65_535);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = streams.open_local(tx).unwrap();
        streams.apply_send_window_delta(10);
        assert_eq!(streams.get_mut(id).unwrap().send_window, 10);
        streams.apply_send_window_delta(65_535);
        assert_eq!(streams.get_mut(id).unwrap().send_window, 65_535);
    }
}
