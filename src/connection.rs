use crate::config::Config;
use crate::events::{Event, EventSink};
use crate::flags::*;
use crate::frame::{
    Frame, FrameReadError, CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE, MAX_ALLOWED_FRAME_SIZE,
};
use crate::status::Status;
use crate::stream::{PendingData, Stream, StreamCoordinator, StreamEvent};
use crate::types::*;
use bytes::{Bytes, BytesMut};
use enum_map::{enum_map, EnumMap};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

/// RFC 7540 §6.5.2 defaults, assumed for the peer until its SETTINGS arrive.
fn default_settings() -> EnumMap<SettingsParameter, u32> {
    enum_map! {
        SettingsParameter::HeaderTableSize => 4_096,
        SettingsParameter::EnablePush => 1,
        SettingsParameter::MaxConcurrentStreams => u32::MAX,
        SettingsParameter::InitialWindowSize => DEFAULT_INITIAL_WINDOW_SIZE,
        SettingsParameter::MaxFrameSize => crate::frame::DEFAULT_MAX_FRAME_SIZE,
        SettingsParameter::MaxHeaderListSize => u32::MAX,
    }
}

#[derive(Default)]
pub(crate) struct ConnState {
    closed: AtomicBool,
    goaway: AtomicBool,
}

/// Commands posted to the connection task. Locally driven stream transitions
/// go through here so that only the connection task mutates stream state.
pub(crate) enum Command {
    Open {
        headers: RawHeaders,
        end_stream: bool,
        reply: oneshot::Sender<Result<OpenedStream, Status>>,
    },
    Headers {
        id: NonZeroStreamId,
        headers: RawHeaders,
        end_stream: bool,
    },
    Data {
        id: NonZeroStreamId,
        data: Bytes,
        end_stream: bool,
        done: oneshot::Sender<Result<(), Status>>,
    },
    Reset {
        id: NonZeroStreamId,
        error: ErrorType,
    },
    Consumed {
        id: NonZeroStreamId,
        bytes: u32,
    },
    GracefulClose,
    HardClose,
}

#[derive(Debug)]
pub(crate) struct OpenedStream {
    pub id: NonZeroStreamId,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

/// A peer-initiated stream surfaced to the server accept loop.
pub(crate) struct IncomingStream {
    pub id: NonZeroStreamId,
    pub headers: RawHeaders,
    pub end_stream: bool,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    pub handle: ConnectionHandle,
}

#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    cmds: mpsc::UnboundedSender<Command>,
    state: Arc<ConnState>,
}

impl ConnectionHandle {
    pub async fn open_stream(
        &self,
        headers: RawHeaders,
        end_stream: bool,
    ) -> Result<OpenedStream, Status> {
        let (reply, response) = oneshot::channel();
        self.cmds
            .send(Command::Open {
                headers,
                end_stream,
                reply,
            })
            .map_err(|_| Status::unavailable("connection is closed"))?;
        response
            .await
            .map_err(|_| Status::unavailable("connection is closed"))?
    }

    pub fn send_headers(&self, id: NonZeroStreamId, headers: RawHeaders, end_stream: bool) {
        self.cmds
            .send(Command::Headers {
                id,
                headers,
                end_stream,
            })
            .ok();
    }

    /// Resolves once the last byte reaches the wire; this is where
    /// flow-control backpressure is felt.
    pub async fn send_data(
        &self,
        id: NonZeroStreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), Status> {
        let (done, response) = oneshot::channel();
        self.cmds
            .send(Command::Data {
                id,
                data,
                end_stream,
                done,
            })
            .map_err(|_| Status::unavailable("connection is closed"))?;
        response
            .await
            .map_err(|_| Status::unavailable("connection is closed"))?
    }

    pub fn reset(&self, id: NonZeroStreamId, error: ErrorType) {
        self.cmds.send(Command::Reset { id, error }).ok();
    }

    pub fn consumed(&self, id: NonZeroStreamId, bytes: u32) {
        if bytes > 0 {
            self.cmds.send(Command::Consumed { id, bytes }).ok();
        }
    }

    pub fn graceful_close(&self) {
        self.cmds.send(Command::GracefulClose).ok();
    }

    pub fn hard_close(&self) {
        self.cmds.send(Command::HardClose).ok();
    }

    /// Whether new calls may be multiplexed onto this connection.
    pub fn is_usable(&self) -> bool {
        !self.state.closed.load(Ordering::SeqCst) && !self.state.goaway.load(Ordering::SeqCst)
    }
}

enum CloseReason {
    Eof,
    Io(String),
    Protocol(H2Error),
}

/// Frames decoded by the reader task, after CONTINUATION reassembly and
/// HPACK decoding, in wire order.
enum ReaderEvent {
    Headers {
        stream: NonZeroStreamId,
        headers: RawHeaders,
        end_stream: bool,
    },
    Data {
        stream: NonZeroStreamId,
        data: Bytes,
        end_stream: bool,
    },
    Reset {
        stream: NonZeroStreamId,
        error: ErrorType,
    },
    Settings {
        params: Vec<(SettingsParameter, u32)>,
    },
    Ping {
        data: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        error: ErrorType,
        debug: Bytes,
    },
    WindowUpdate {
        stream: StreamId,
        increment: NonZeroU32,
    },
    Closed(CloseReason),
}

/// Pumps frames off the transport. Owns the HPACK decoder: header blocks
/// must be decoded in exactly the order they appear on the wire.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::Sender<ReaderEvent>,
    max_frame_size: u32,
    max_header_list_size: u32,
) {
    let mut decoder = hpack::Decoder::new();
    let reason = 'conn: loop {
        let frame = match Frame::read_from(&mut reader, max_frame_size).await {
            Ok(frame) => frame,
            Err(FrameReadError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                break CloseReason::Eof;
            }
            Err(FrameReadError::Io(err)) => break CloseReason::Io(err.to_string()),
            Err(FrameReadError::Decode(err)) => {
                break CloseReason::Protocol(H2Error::connection(
                    err.error_type(),
                    err.to_string(),
                ));
            }
            Err(FrameReadError::Oversize(length)) => {
                break CloseReason::Protocol(H2Error::connection(
                    ErrorType::FrameSizeError,
                    format!("{length} byte frame exceeds SETTINGS_MAX_FRAME_SIZE"),
                ));
            }
        };
        trace!("recv frame {:?} stream {}", frame.ty(), frame.stream_id());
        let event = match frame {
            Frame::Headers {
                stream,
                flags,
                fragment,
            } => {
                let end_stream = flags.contains(HeadersFlags::END_STREAM);
                let mut block = BytesMut::from(&fragment[..]);
                if !flags.contains(HeadersFlags::END_HEADERS) {
                    // nothing but CONTINUATION for this stream may follow
                    loop {
                        match Frame::read_from(&mut reader, max_frame_size).await {
                            Ok(Frame::Continuation {
                                stream: cont_stream,
                                flags,
                                fragment,
                            }) if cont_stream == stream => {
                                block.extend_from_slice(&fragment);
                                if flags.contains(ContinuationFlags::END_HEADERS) {
                                    break;
                                }
                            }
                            _ => {
                                break 'conn CloseReason::Protocol(H2Error::connection(
                                    ErrorType::ProtocolError,
                                    "header block interrupted before END_HEADERS",
                                ));
                            }
                        }
                    }
                }
                match decode_header_block(&mut decoder, &block, max_header_list_size) {
                    Ok(headers) => ReaderEvent::Headers {
                        stream,
                        headers,
                        end_stream,
                    },
                    Err(err) => break CloseReason::Protocol(err),
                }
            }
            Frame::Continuation { .. } => {
                break CloseReason::Protocol(H2Error::connection(
                    ErrorType::ProtocolError,
                    "CONTINUATION outside of a header block",
                ));
            }
            Frame::PushPromise { .. } => {
                break CloseReason::Protocol(H2Error::connection(
                    ErrorType::ProtocolError,
                    "push is disabled",
                ));
            }
            Frame::Data {
                stream,
                flags,
                data,
            } => ReaderEvent::Data {
                stream,
                data,
                end_stream: flags.contains(DataFlags::END_STREAM),
            },
            Frame::Priority { .. } => continue,
            Frame::ResetStream { stream, error } => ReaderEvent::Reset { stream, error },
            Frame::Settings { flags, params } => {
                if flags.contains(SettingsFlags::ACK) {
                    continue;
                }
                ReaderEvent::Settings { params }
            }
            Frame::Ping { flags, data } => {
                if flags.contains(PingFlags::ACK) {
                    continue;
                }
                ReaderEvent::Ping { data }
            }
            Frame::GoAway {
                last_stream,
                error,
                debug,
            } => ReaderEvent::GoAway {
                last_stream,
                error,
                debug,
            },
            Frame::WindowUpdate { stream, increment } => {
                ReaderEvent::WindowUpdate { stream, increment }
            }
        };
        if tx.send(event).await.is_err() {
            return;
        }
    };
    tx.send(ReaderEvent::Closed(reason)).await.ok();
}

fn decode_header_block(
    decoder: &mut hpack::Decoder<'_>,
    block: &[u8],
    max_header_list_size: u32,
) -> Result<RawHeaders, H2Error> {
    let list = decoder.decode(block).map_err(|err| {
        H2Error::connection(
            ErrorType::CompressionError,
            format!("header block decoding failed: {err:?}"),
        )
    })?;
    let total: usize = list.iter().map(|(k, v)| k.len() + v.len() + 32).sum();
    if total > max_header_list_size as usize {
        return Err(H2Error::connection(
            ErrorType::ProtocolError,
            "header list exceeds SETTINGS_MAX_HEADER_LIST_SIZE",
        ));
    }
    Ok(list
        .into_iter()
        .map(|(key, value)| (Bytes::from(key), Bytes::from(value)))
        .collect())
}

enum Exit {
    Clean,
    Hard,
    Transport(String),
    Fatal(H2Error),
}

pub(crate) struct Connection;

impl Connection {
    /// Drives one transport. The returned receiver yields peer-initiated
    /// streams (servers only; it stays silent for clients).
    pub(crate) fn spawn<IO>(
        io: IO,
        side: Side,
        config: Arc<Config>,
        events: Arc<dyn EventSink>,
    ) -> (
        ConnectionHandle,
        mpsc::UnboundedReceiver<IncomingStream>,
        JoinHandle<()>,
    )
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ConnState::default());
        let handle = ConnectionHandle {
            cmds: cmd_tx,
            state: state.clone(),
        };
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let actor_handle = handle.clone();
        let join = tokio::spawn(async move {
            let (mut read_half, mut write_half) = tokio::io::split(io);
            if let Err(err) = handshake(side, &mut read_half, &mut write_half, &config).await {
                debug!("connection handshake failed: {err}");
                actor_handle.state.closed.store(true, Ordering::SeqCst);
                return;
            }
            let (reader_tx, reader_rx) = mpsc::channel(32);
            let reader = tokio::spawn(read_loop(
                read_half,
                reader_tx,
                config.max_frame_size,
                config.max_header_list_size,
            ));
            let conn_recv = i64::from(DEFAULT_INITIAL_WINDOW_SIZE.max(config.initial_window_size));
            let actor = ConnectionActor {
                side,
                writer: write_half,
                buf: BytesMut::with_capacity(16 * 1024),
                encoder: hpack::Encoder::new(),
                config: config.clone(),
                events,
                handle: actor_handle,
                streams: StreamCoordinator::new(side == Side::Client, config.initial_window_size),
                peer_settings: default_settings(),
                conn_send_window: i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
                conn_recv_remaining: conn_recv,
                conn_recv_target: conn_recv as u32,
                conn_recv_consumed: 0,
                cmds: cmd_rx,
                reader: reader_rx,
                incoming: incoming_tx,
                goaway_sent: None,
                goaway_recv: None,
                closing: false,
                pending_opens: VecDeque::new(),
                local_active: 0,
            };
            actor.run().await;
            reader.abort();
        });
        (handle, incoming_rx, join)
    }
}

async fn handshake<R, W>(
    side: Side,
    reader: &mut R,
    writer: &mut W,
    config: &Config,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    match side {
        Side::Client => {
            buf.extend_from_slice(CONNECTION_PREFACE);
        }
        Side::Server => {
            let mut preface = [0u8; CONNECTION_PREFACE.len()];
            reader.read_exact(&mut preface).await?;
            if preface != *CONNECTION_PREFACE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "bad connection preface",
                ));
            }
        }
    }
    let mut params = vec![
        (
            SettingsParameter::InitialWindowSize,
            config.initial_window_size,
        ),
        (SettingsParameter::MaxFrameSize, config.max_frame_size),
        (
            SettingsParameter::MaxHeaderListSize,
            config.max_header_list_size,
        ),
    ];
    match side {
        Side::Client => params.push((SettingsParameter::EnablePush, 0)),
        Side::Server => params.push((
            SettingsParameter::MaxConcurrentStreams,
            config.max_concurrent_streams,
        )),
    }
    Frame::Settings {
        flags: SettingsFlags::empty(),
        params,
    }
    .encode(&mut buf);
    if config.initial_window_size > DEFAULT_INITIAL_WINDOW_SIZE {
        // grow the connection window to match per-stream credit
        Frame::WindowUpdate {
            stream: 0,
            // unwrap: strictly positive by the surrounding check
            increment: NonZeroU32::new(config.initial_window_size - DEFAULT_INITIAL_WINDOW_SIZE)
                .unwrap(),
        }
        .encode(&mut buf);
    }
    writer.write_all(&buf).await
}

struct PendingOpen {
    headers: RawHeaders,
    end_stream: bool,
    reply: oneshot::Sender<Result<OpenedStream, Status>>,
}

struct ConnectionActor<W> {
    side: Side,
    writer: W,
    buf: BytesMut,
    encoder: hpack::Encoder<'static>,
    config: Arc<Config>,
    events: Arc<dyn EventSink>,
    handle: ConnectionHandle,
    streams: StreamCoordinator,
    peer_settings: EnumMap<SettingsParameter, u32>,
    conn_send_window: i64,
    conn_recv_remaining: i64,
    conn_recv_target: u32,
    conn_recv_consumed: u32,
    cmds: mpsc::UnboundedReceiver<Command>,
    reader: mpsc::Receiver<ReaderEvent>,
    incoming: mpsc::UnboundedSender<IncomingStream>,
    goaway_sent: Option<StreamId>,
    goaway_recv: Option<StreamId>,
    closing: bool,
    pending_opens: VecDeque<PendingOpen>,
    /// Locally initiated streams currently live, gated by the peer's
    /// SETTINGS_MAX_CONCURRENT_STREAMS.
    local_active: usize,
}

impl<W: AsyncWrite + Unpin> ConnectionActor<W> {
    async fn run(mut self) {
        let exit = self.event_loop().await;
        match exit {
            Exit::Clean => {}
            Exit::Hard => {
                self.fail_all(Status::unavailable("connection closed"));
            }
            Exit::Transport(reason) => {
                debug!("connection transport lost: {reason}");
                self.fail_all(Status::unavailable(format!(
                    "connection lost: {reason}"
                )));
            }
            Exit::Fatal(err) => {
                warn!("connection fatal error: {err}");
                let last = self.streams.highest_remote;
                self.write_goaway(last, err.error_type(), err.to_string())
                    .await
                    .ok();
                self.fail_all(Status::internal(format!("connection error: {err}")));
            }
        }
        for open in self.pending_opens.drain(..) {
            open.reply
                .send(Err(Status::unavailable("connection closed")))
                .ok();
        }
        self.handle.state.closed.store(true, Ordering::SeqCst);
        self.writer.shutdown().await.ok();
    }

    async fn event_loop(&mut self) -> Exit {
        loop {
            let step = tokio::select! {
                biased;
                cmd = self.cmds.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    // every handle is gone, nobody can observe this
                    // connection any more
                    None => return Exit::Clean,
                },
                event = self.reader.recv() => match event {
                    Some(event) => self.on_reader(event).await,
                    None => return Exit::Transport("frame reader stopped".to_owned()),
                },
            };
            if let Err(exit) = step {
                return exit;
            }
            if self.closing && self.streams.is_empty() {
                return Exit::Clean;
            }
        }
    }

    fn is_local(&self, id: NonZeroStreamId) -> bool {
        (id.get() % 2 == 1) == (self.side == Side::Client)
    }

    fn accepts_new_streams(&self) -> bool {
        !self.closing && self.goaway_sent.is_none() && self.goaway_recv.is_none()
    }

    async fn flush(&mut self) -> Result<(), Exit> {
        if !self.buf.is_empty() {
            let buf = self.buf.split();
            self.writer
                .write_all(&buf)
                .await
                .map_err(|err| Exit::Transport(err.to_string()))?;
        }
        Ok(())
    }

    async fn write_goaway(
        &mut self,
        last_stream: StreamId,
        error: ErrorType,
        message: String,
    ) -> Result<(), Exit> {
        if self.goaway_sent.is_none() {
            self.goaway_sent = Some(last_stream);
            self.handle.state.goaway.store(true, Ordering::SeqCst);
            Frame::GoAway {
                last_stream,
                error,
                debug: message.into(),
            }
            .encode(&mut self.buf);
            self.flush().await?;
            self.events
                .on_event(&Event::GoAwaySent { last_stream, error });
        }
        Ok(())
    }

    /// HEADERS plus any CONTINUATION frames, emitted back to back: the
    /// encoder's dynamic table state and the wire must never diverge.
    async fn write_headers(
        &mut self,
        id: NonZeroStreamId,
        headers: &RawHeaders,
        end_stream: bool,
    ) -> Result<(), Exit> {
        let block = self
            .encoder
            .encode(headers.iter().map(|(k, v)| (k.as_ref(), v.as_ref())));
        let max = self.peer_settings[SettingsParameter::MaxFrameSize] as usize;
        let chunks: Vec<&[u8]> = if block.is_empty() {
            vec![&[]]
        } else {
            block.chunks(max).collect()
        };
        let last = chunks.len() - 1;
        for (index, chunk) in chunks.iter().enumerate() {
            if index == 0 {
                Frame::Headers {
                    stream: id,
                    flags: HeadersFlags::for_block(index == last, end_stream),
                    fragment: Bytes::copy_from_slice(chunk),
                }
                .encode(&mut self.buf);
            } else {
                Frame::Continuation {
                    stream: id,
                    flags: ContinuationFlags::for_block(index == last),
                    fragment: Bytes::copy_from_slice(chunk),
                }
                .encode(&mut self.buf);
            }
        }
        self.flush().await
    }

    async fn on_command(&mut self, cmd: Command) -> Result<(), Exit> {
        match cmd {
            Command::Open {
                headers,
                end_stream,
                reply,
            } => {
                self.try_open(PendingOpen {
                    headers,
                    end_stream,
                    reply,
                })
                .await
            }
            Command::Headers {
                id,
                headers,
                end_stream,
            } => self.on_send_headers(id, headers, end_stream).await,
            Command::Data {
                id,
                data,
                end_stream,
                done,
            } => self.on_send_data(id, data, end_stream, done).await,
            Command::Reset { id, error } => self.on_local_reset(id, error).await,
            Command::Consumed { id, bytes } => self.on_consumed(id, bytes).await,
            Command::GracefulClose => {
                let last = match self.side {
                    Side::Server => self.streams.highest_remote,
                    Side::Client => 0,
                };
                self.closing = true;
                self.write_goaway(last, ErrorType::NoError, String::new())
                    .await?;
                for open in self.pending_opens.drain(..) {
                    open.reply
                        .send(Err(Status::unavailable("connection is closing")))
                        .ok();
                }
                Ok(())
            }
            Command::HardClose => Err(Exit::Hard),
        }
    }

    async fn try_open(&mut self, open: PendingOpen) -> Result<(), Exit> {
        if !self.accepts_new_streams() {
            open.reply
                .send(Err(Status::unavailable("connection is closing")))
                .ok();
            return Ok(());
        }
        let limit = self.peer_settings[SettingsParameter::MaxConcurrentStreams] as usize;
        if self.local_active >= limit {
            // suspends the caller until a slot frees up
            self.pending_opens.push_back(open);
            return Ok(());
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = match self.streams.open_local(events_tx) {
            Ok(id) => id,
            Err(status) => {
                open.reply.send(Err(status)).ok();
                return Ok(());
            }
        };
        self.local_active += 1;
        self.streams
            .with_stream(id, |stream| {
                stream.transition_state(false, FrameType::Headers, open.end_stream)
            })
            .transpose()
            .map_err(Exit::Fatal)?;
        self.write_headers(id, &open.headers, open.end_stream).await?;
        if open
            .reply
            .send(Ok(OpenedStream { id, events: events_rx }))
            .is_err()
        {
            // caller went away between queueing and opening
            self.on_local_reset(id, ErrorType::Cancel).await?;
        }
        Ok(())
    }

    async fn on_send_headers(
        &mut self,
        id: NonZeroStreamId,
        headers: RawHeaders,
        end_stream: bool,
    ) -> Result<(), Exit> {
        let Some(transitioned) = self.streams.with_stream(id, |stream| {
            if stream.local_open() {
                stream
                    .transition_state(false, FrameType::Headers, end_stream)
                    .is_ok()
            } else {
                false
            }
        }) else {
            return Ok(());
        };
        if !transitioned {
            return Ok(());
        }
        self.write_headers(id, &headers, end_stream).await?;
        self.after_state_change(id).await
    }

    async fn on_send_data(
        &mut self,
        id: NonZeroStreamId,
        data: Bytes,
        end_stream: bool,
        done: oneshot::Sender<Result<(), Status>>,
    ) -> Result<(), Exit> {
        match self.streams.get_mut(id) {
            None => {
                done.send(Err(Status::cancelled("stream is closed"))).ok();
                Ok(())
            }
            Some(stream) if !stream.local_open() => {
                done.send(Err(Status::internal("stream is no longer writable")))
                    .ok();
                Ok(())
            }
            Some(stream) => {
                stream.pending_send.push_back(PendingData {
                    data,
                    end_stream,
                    done: Some(done),
                });
                self.pump_stream(id).await
            }
        }
    }

    /// Writes as much queued DATA as flow-control credit allows, completing
    /// senders whose final byte hit the wire.
    async fn pump_stream(&mut self, id: NonZeroStreamId) -> Result<(), Exit> {
        let max_frame = self.peer_settings[SettingsParameter::MaxFrameSize] as i64;
        loop {
            let Some(stream) = self.streams.get_mut(id) else {
                return Ok(());
            };
            let Some(front) = stream.pending_send.front_mut() else {
                return Ok(());
            };
            let chunk;
            let end_stream_now;
            if front.data.is_empty() {
                chunk = Bytes::new();
                end_stream_now = front.end_stream;
            } else {
                let budget = self
                    .conn_send_window
                    .min(stream.send_window)
                    .min(max_frame);
                if budget <= 0 {
                    return Ok(());
                }
                let take = (budget as usize).min(front.data.len());
                chunk = front.data.split_to(take);
                self.conn_send_window -= take as i64;
                stream.send_window -= take as i64;
                end_stream_now = front.end_stream && front.data.is_empty();
            }
            let finished = front.data.is_empty();
            let done = if finished {
                // unwrap: front() above proved the queue is non-empty
                let pending = stream.pending_send.pop_front().unwrap();
                pending.done
            } else {
                None
            };
            stream
                .transition_state(false, FrameType::Data, end_stream_now)
                .ok();
            Frame::Data {
                stream: id,
                flags: DataFlags::with_end_stream(end_stream_now),
                data: chunk,
            }
            .encode(&mut self.buf);
            self.flush().await?;
            if let Some(done) = done {
                done.send(Ok(())).ok();
            }
            if end_stream_now {
                self.after_state_change(id).await?;
            }
            if finished && !end_stream_now {
                continue;
            }
            if finished {
                return Ok(());
            }
        }
    }

    async fn pump_all(&mut self) -> Result<(), Exit> {
        for id in self.streams.ids() {
            self.pump_stream(id).await?;
        }
        Ok(())
    }

    /// Sends RST_STREAM and tears the stream down locally.
    async fn on_local_reset(&mut self, id: NonZeroStreamId, error: ErrorType) -> Result<(), Exit> {
        if let Some(mut stream) = self.streams.remove(id) {
            if !stream.is_closed() && !stream.reset_sent {
                stream.reset_sent = true;
                Frame::ResetStream { stream: id, error }.encode(&mut self.buf);
                self.flush().await?;
            }
            stream.abort(Status::cancelled("stream reset locally"));
            self.stream_gone(id);
            self.service_pending_opens().await?;
        }
        Ok(())
    }

    async fn on_consumed(&mut self, id: NonZeroStreamId, bytes: u32) -> Result<(), Exit> {
        let half_initial = ((self.streams.initial_recv_window.max(2) / 2) as u32).max(1);
        let refill = self
            .streams
            .with_stream(id, |stream| {
                stream.recv_consumed = stream.recv_consumed.saturating_add(bytes);
                if stream.remote_open() && stream.recv_consumed >= half_initial {
                    let increment = stream.recv_consumed;
                    stream.recv_consumed = 0;
                    stream.recv_window += i64::from(increment);
                    Some(increment)
                } else {
                    None
                }
            })
            .flatten();
        if let Some(increment) = refill {
            // unwrap: increment crossed a positive threshold
            Frame::WindowUpdate {
                stream: id.get(),
                increment: NonZeroU32::new(increment).unwrap(),
            }
            .encode(&mut self.buf);
            self.flush().await?;
        }
        Ok(())
    }

    /// Removes closed streams and releases their concurrency slot.
    async fn after_state_change(&mut self, id: NonZeroStreamId) -> Result<(), Exit> {
        let closed = self
            .streams
            .with_stream(id, |stream| Stream::is_closed(stream))
            .unwrap_or(false);
        if closed {
            if let Some(mut stream) = self.streams.remove(id) {
                stream.abort(Status::ok());
            }
            self.stream_gone(id);
            self.service_pending_opens().await?;
        }
        Ok(())
    }

    fn stream_gone(&mut self, id: NonZeroStreamId) {
        if self.is_local(id) {
            self.local_active = self.local_active.saturating_sub(1);
        }
    }

    async fn service_pending_opens(&mut self) -> Result<(), Exit> {
        let limit = self.peer_settings[SettingsParameter::MaxConcurrentStreams] as usize;
        while self.local_active < limit {
            let Some(open) = self.pending_opens.pop_front() else {
                return Ok(());
            };
            Box::pin(self.try_open(open)).await?;
        }
        Ok(())
    }

    async fn on_reader(&mut self, event: ReaderEvent) -> Result<(), Exit> {
        match event {
            ReaderEvent::Headers {
                stream,
                headers,
                end_stream,
            } => self.on_recv_headers(stream, headers, end_stream).await,
            ReaderEvent::Data {
                stream,
                data,
                end_stream,
            } => self.on_recv_data(stream, data, end_stream).await,
            ReaderEvent::Reset { stream, error } => self.on_recv_reset(stream, error).await,
            ReaderEvent::Settings { params } => self.on_recv_settings(params).await,
            ReaderEvent::Ping { data } => {
                Frame::Ping {
                    flags: PingFlags::ACK,
                    data,
                }
                .encode(&mut self.buf);
                self.flush().await
            }
            ReaderEvent::GoAway {
                last_stream,
                error,
                debug,
            } => self.on_recv_goaway(last_stream, error, &debug).await,
            ReaderEvent::WindowUpdate { stream, increment } => {
                self.on_recv_window_update(stream, increment).await
            }
            ReaderEvent::Closed(CloseReason::Eof) => {
                Err(Exit::Transport("peer closed the connection".to_owned()))
            }
            ReaderEvent::Closed(CloseReason::Io(err)) => Err(Exit::Transport(err)),
            ReaderEvent::Closed(CloseReason::Protocol(err)) => Err(Exit::Fatal(err)),
        }
    }

    /// True when a frame for an untracked stream identifier refers to a
    /// stream that already finished, which must be tolerated.
    fn is_stale(&self, id: NonZeroStreamId) -> bool {
        if self.is_local(id) {
            id.get() <= self.streams.highest_local
        } else {
            id.get() <= self.streams.highest_remote
        }
    }

    async fn on_recv_headers(
        &mut self,
        id: NonZeroStreamId,
        headers: RawHeaders,
        end_stream: bool,
    ) -> Result<(), Exit> {
        if let Some(result) = self.streams.with_stream(id, |stream| {
            stream.transition_state(true, FrameType::Headers, end_stream)
        }) {
            match result {
                Ok(()) => {
                    self.streams.with_stream(id, |stream| {
                        stream.deliver(StreamEvent::Headers {
                            headers,
                            end_stream,
                        });
                    });
                    return self.after_state_change(id).await;
                }
                Err(err) => return self.handle_stream_error(err).await,
            }
        }
        // unknown stream
        if self.is_stale(id) {
            trace!("ignoring HEADERS for finished stream {id}");
            return Ok(());
        }
        if self.side == Side::Client {
            return Err(Exit::Fatal(H2Error::connection(
                ErrorType::ProtocolError,
                "server initiated a stream",
            )));
        }
        if !self.accepts_new_streams() {
            // drained by GOAWAY; the peer will retry elsewhere
            self.streams.highest_remote = self.streams.highest_remote.max(id.get());
            Frame::ResetStream {
                stream: id,
                error: ErrorType::RefusedStream,
            }
            .encode(&mut self.buf);
            return self.flush().await;
        }
        let remote_active = self.streams.len() - self.local_active.min(self.streams.len());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stream = self
            .streams
            .open_remote(id, self.side == Side::Client, events_tx)
            .map_err(Exit::Fatal)?;
        stream
            .transition_state(true, FrameType::Headers, end_stream)
            .map_err(Exit::Fatal)?;
        if remote_active >= self.config.max_concurrent_streams as usize {
            return self.on_local_reset(id, ErrorType::RefusedStream).await;
        }
        let incoming = IncomingStream {
            id,
            headers,
            end_stream,
            events: events_rx,
            handle: self.handle.clone(),
        };
        if self.incoming.send(incoming).is_err() {
            return self.on_local_reset(id, ErrorType::RefusedStream).await;
        }
        self.after_state_change(id).await
    }

    async fn on_recv_data(
        &mut self,
        id: NonZeroStreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), Exit> {
        let length = data.len() as i64;
        self.conn_recv_remaining -= length;
        if self.conn_recv_remaining < 0 {
            return Err(Exit::Fatal(H2Error::connection(
                ErrorType::FlowControlError,
                "connection flow-control window exceeded",
            )));
        }
        // connection-level credit is returned as soon as the bytes are
        // queued; per-stream credit waits for the application
        self.conn_recv_consumed += length as u32;
        if self.conn_recv_consumed >= self.conn_recv_target / 2 {
            let increment = self.conn_recv_consumed;
            self.conn_recv_consumed = 0;
            self.conn_recv_remaining += i64::from(increment);
            Frame::WindowUpdate {
                stream: 0,
                // unwrap: the increment crossed a positive threshold
                increment: NonZeroU32::new(increment).unwrap(),
            }
            .encode(&mut self.buf);
            self.flush().await?;
        }
        let Some(outcome) = self.streams.with_stream(id, |stream| {
            stream.recv_window -= length;
            if stream.recv_window < 0 {
                return Err(H2Error::connection(
                    ErrorType::FlowControlError,
                    "stream flow-control window exceeded",
                ));
            }
            stream.transition_state(true, FrameType::Data, end_stream)?;
            stream.deliver(StreamEvent::Data { data, end_stream });
            Ok(())
        }) else {
            if self.is_stale(id) {
                trace!("ignoring DATA for finished stream {id}");
                return Ok(());
            }
            return Err(Exit::Fatal(H2Error::connection(
                ErrorType::ProtocolError,
                "DATA on an idle stream",
            )));
        };
        match outcome {
            Ok(()) => self.after_state_change(id).await,
            Err(err) => self.handle_stream_error(err).await,
        }
    }

    async fn on_recv_reset(&mut self, id: NonZeroStreamId, error: ErrorType) -> Result<(), Exit> {
        if let Some(mut stream) = self.streams.remove(id) {
            stream
                .transition_state(true, FrameType::ResetStream, false)
                .map_err(Exit::Fatal)?;
            for pending in stream.pending_send.drain(..) {
                if let Some(done) = pending.done {
                    done.send(Err(crate::stream::status_from_reset(error))).ok();
                }
            }
            stream.deliver(StreamEvent::Reset { error });
            self.stream_gone(id);
            return self.service_pending_opens().await;
        }
        if self.is_stale(id) {
            return Ok(());
        }
        Err(Exit::Fatal(H2Error::connection(
            ErrorType::ProtocolError,
            "RST_STREAM on an idle stream",
        )))
    }

    async fn on_recv_settings(
        &mut self,
        params: Vec<(SettingsParameter, u32)>,
    ) -> Result<(), Exit> {
        for (param, value) in params {
            match param {
                SettingsParameter::EnablePush => {
                    if value > 1 {
                        return Err(Exit::Fatal(H2Error::connection(
                            ErrorType::ProtocolError,
                            "invalid SETTINGS_ENABLE_PUSH value",
                        )));
                    }
                    // a client peer may not enable push; a server peer
                    // advertising the default is harmless since we never
                    // send PUSH_PROMISE
                    if value == 1 && self.side == Side::Server {
                        return Err(Exit::Fatal(H2Error::connection(
                            ErrorType::ProtocolError,
                            "push is not supported",
                        )));
                    }
                }
                SettingsParameter::InitialWindowSize => {
                    if value > U31_MAX.get() {
                        return Err(Exit::Fatal(H2Error::connection(
                            ErrorType::FlowControlError,
                            "SETTINGS_INITIAL_WINDOW_SIZE above 2^31-1",
                        )));
                    }
                    self.streams.apply_send_window_delta(value);
                }
                SettingsParameter::MaxFrameSize => {
                    if !(crate::frame::DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE)
                        .contains(&value)
                    {
                        return Err(Exit::Fatal(H2Error::connection(
                            ErrorType::ProtocolError,
                            "SETTINGS_MAX_FRAME_SIZE out of range",
                        )));
                    }
                }
                SettingsParameter::HeaderTableSize
                | SettingsParameter::MaxConcurrentStreams
                | SettingsParameter::MaxHeaderListSize => {}
            }
            self.peer_settings[param] = value;
        }
        Frame::Settings {
            flags: SettingsFlags::ACK,
            params: Vec::new(),
        }
        .encode(&mut self.buf);
        self.flush().await?;
        self.pump_all().await?;
        self.service_pending_opens().await
    }

    async fn on_recv_goaway(
        &mut self,
        last_stream: StreamId,
        error: ErrorType,
        debug: &Bytes,
    ) -> Result<(), Exit> {
        if !debug.is_empty() {
            debug!("goaway debug data: {}", String::from_utf8_lossy(debug));
        }
        self.goaway_recv = Some(last_stream);
        self.handle.state.goaway.store(true, Ordering::SeqCst);
        self.events.on_event(&Event::GoAwayReceived { last_stream, error });
        for open in self.pending_opens.drain(..) {
            open.reply
                .send(Err(Status::unavailable("connection received GOAWAY")))
                .ok();
        }
        // streams the peer will not process die here; the rest run out
        let doomed: Vec<NonZeroStreamId> = self
            .streams
            .ids()
            .into_iter()
            .filter(|id| self.is_local(*id) && id.get() > last_stream)
            .collect();
        for id in doomed {
            if let Some(mut stream) = self.streams.remove(id) {
                stream.abort(Status::unavailable("stream refused by GOAWAY"));
            }
            self.stream_gone(id);
        }
        if error != ErrorType::NoError {
            return Err(Exit::Transport(format!(
                "peer closed the connection with {error:?}"
            )));
        }
        self.closing = true;
        Ok(())
    }

    async fn on_recv_window_update(
        &mut self,
        stream: StreamId,
        increment: NonZeroU32,
    ) -> Result<(), Exit> {
        match NonZeroStreamId::new(stream) {
            None => {
                self.conn_send_window += i64::from(increment.get());
                if self.conn_send_window > i64::from(U31_MAX.get()) {
                    return Err(Exit::Fatal(H2Error::connection(
                        ErrorType::FlowControlError,
                        "connection send window overflow",
                    )));
                }
                self.pump_all().await
            }
            Some(id) => {
                let overflow = self.streams.with_stream(id, |stream| {
                    stream.send_window += i64::from(increment.get());
                    stream.send_window > i64::from(U31_MAX.get())
                });
                match overflow {
                    None => Ok(()),
                    Some(true) => {
                        self.handle_stream_error(H2Error::stream(
                            id.get(),
                            ErrorType::FlowControlError,
                        ))
                        .await
                    }
                    Some(false) => self.pump_stream(id).await,
                }
            }
        }
    }

    /// Stream errors reset the one stream; connection errors abort the lot.
    async fn handle_stream_error(&mut self, err: H2Error) -> Result<(), Exit> {
        match err {
            H2Error::Stream(id, error) => {
                // unwrap: stream errors always name a real stream
                let id = NonZeroStreamId::new(id).unwrap();
                self.on_local_reset(id, error).await
            }
            fatal @ H2Error::Connection(..) => Err(Exit::Fatal(fatal)),
        }
    }

    fn fail_all(&mut self, status: Status) {
        for stream in self.streams.iter_mut() {
            stream.abort(status.clone());
        }
        let ids = self.streams.ids();
        for id in ids {
            self.streams.remove(id);
        }
        self.local_active = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEvents;

    fn pair() -> (
        ConnectionHandle,
        mpsc::UnboundedReceiver<IncomingStream>,
        ConnectionHandle,
    ) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let config = Arc::new(Config::default());
        let (client, _no_incoming, _join_c) = Connection::spawn(
            client_io,
            Side::Client,
            config.clone(),
            Arc::new(NoopEvents),
        );
        let (server, incoming, _join_s) =
            Connection::spawn(server_io, Side::Server, config, Arc::new(NoopEvents));
        (client, incoming, server)
    }

    fn request_headers() -> RawHeaders {
        vec![
            (Bytes::from_static(b":method"), Bytes::from_static(b"POST")),
            (Bytes::from_static(b":scheme"), Bytes::from_static(b"http")),
            (Bytes::from_static(b":path"), Bytes::from_static(b"/p.S/M")),
        ]
    }

    #[test]
    fn header_block_round_trip() {
        let mut encoder = hpack::Encoder::new();
        let mut decoder = hpack::Decoder::new();
        let headers: RawHeaders = vec![
            (Bytes::from_static(b":method"), Bytes::from_static(b"POST")),
            (
                Bytes::from_static(b":path"),
                Bytes::from_static(b"/pkg.Service/Method"),
            ),
            (
                Bytes::from_static(b"grpc-timeout"),
                Bytes::from_static(b"100m"),
            ),
            (Bytes::from_static(b"x-custom"), Bytes::from_static(b"a b")),
        ];
        let block = encoder.encode(headers.iter().map(|(k, v)| (k.as_ref(), v.as_ref())));
        let decoded = decode_header_block(&mut decoder, &block, u32::MAX).unwrap();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn header_list_size_enforced() {
        let mut encoder = hpack::Encoder::new();
        let mut decoder = hpack::Decoder::new();
        let headers: RawHeaders = vec![(
            Bytes::from_static(b"x-big"),
            Bytes::from(vec![b'a'; 1_024]),
        )];
        let block = encoder.encode(headers.iter().map(|(k, v)| (k.as_ref(), v.as_ref())));
        assert!(decode_header_block(&mut decoder, &block, 64).is_err());
    }

    #[tokio::test]
    async fn headers_and_data_round_trip() {
        let (client, mut incoming, _server) = pair();
        let opened = client.open_stream(request_headers(), false).await.unwrap();
        let mut accepted = incoming.recv().await.unwrap();
        assert_eq!(accepted.id, opened.id);
        assert!(!accepted.end_stream);
        assert_eq!(accepted.headers[0].1.as_ref(), b"POST");

        client
            .send_data(opened.id, Bytes::from_static(b"ping"), true)
            .await
            .unwrap();
        match accepted.events.recv().await.unwrap() {
            StreamEvent::Data { data, end_stream } => {
                assert_eq!(data.as_ref(), b"ping");
                assert!(end_stream);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_reply_reaches_client() {
        let (client, mut incoming, _server) = pair();
        let mut opened = client.open_stream(request_headers(), true).await.unwrap();
        let accepted = incoming.recv().await.unwrap();
        accepted.handle.send_headers(
            accepted.id,
            vec![(Bytes::from_static(b":status"), Bytes::from_static(b"200"))],
            false,
        );
        accepted
            .handle
            .send_data(accepted.id, Bytes::from_static(b"pong"), true)
            .await
            .unwrap();

        match opened.events.recv().await.unwrap() {
            StreamEvent::Headers { headers, end_stream } => {
                assert!(!end_stream);
                assert_eq!(headers[0].1.as_ref(), b"200");
            }
            other => panic!("unexpected event {other:?}"),
        }
        match opened.events.recv().await.unwrap() {
            StreamEvent::Data { data, end_stream } => {
                assert_eq!(data.as_ref(), b"pong");
                assert!(end_stream);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn goaway_refuses_new_streams() {
        let (client, mut incoming, server) = pair();
        let opened = client.open_stream(request_headers(), false).await.unwrap();
        let _accepted = incoming.recv().await.unwrap();
        server.graceful_close();
        // the client eventually observes GOAWAY and refuses to open
        let mut refused = false;
        for _ in 0..50 {
            if !client.is_usable() {
                refused = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(refused, "client never observed GOAWAY");
        let err = client
            .open_stream(request_headers(), false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Unavailable);
        drop(opened);
    }

    #[tokio::test]
    async fn peer_reset_surfaces_to_sender() {
        let (client, mut incoming, _server) = pair();
        let mut opened = client.open_stream(request_headers(), false).await.unwrap();
        let accepted = incoming.recv().await.unwrap();
        accepted.handle.reset(accepted.id, ErrorType::Cancel);
        match opened.events.recv().await.unwrap() {
            StreamEvent::Reset { error } => assert_eq!(error, ErrorType::Cancel),
            other => panic!("unexpected event {other:?}"),
        }
        drop(client);
    }

    #[tokio::test]
    async fn large_message_pushes_through_flow_control() {
        let (client, mut incoming, _server) = pair();
        let opened = client.open_stream(request_headers(), false).await.unwrap();
        let mut accepted = incoming.recv().await.unwrap();
        // larger than both the 65_535 initial window and one frame
        let payload = Bytes::from(vec![0x42u8; 200_000]);
        let sender = {
            let client = client.clone();
            let id = opened.id;
            let payload = payload.clone();
            tokio::spawn(async move { client.send_data(id, payload, true).await })
        };
        let mut received = Vec::new();
        loop {
            match accepted.events.recv().await.unwrap() {
                StreamEvent::Data { data, end_stream } => {
                    accepted.handle.consumed(accepted.id, data.len() as u32);
                    received.extend_from_slice(&data);
                    if end_stream {
                        break;
                    }
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        sender.await.unwrap().unwrap();
        assert_eq!(received.len(), payload.len());
        assert!(received.iter().all(|&b| b == 0x42));
    }
}
