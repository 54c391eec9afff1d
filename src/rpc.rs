use crate::cancel::{CancelToken, DeadlineTimer};
use crate::codec::Codec;
use crate::compression::Compressor;
use crate::config::Config;
use crate::connection::{ConnectionHandle, Side};
use crate::events::{Event, EventSink};
use crate::message::{encode_message, MessageReader};
use crate::metadata::{Deadline, Metadata};
use crate::request::RpcRequest;
use crate::response::{
    build_response_headers, build_trailers, build_trailers_only, has_grpc_status,
    parse_response_headers, parse_trailers,
};
use crate::status::Status;
use crate::stream::{status_from_reset, StreamEvent};
use crate::types::{ErrorType, NonZeroStreamId, RawHeaders};
use bytes::{Bytes, BytesMut};
use derivative::Derivative;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// How many messages each direction of a method may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Cardinality {
    #[display(fmt = "unary-unary")]
    UnaryUnary,
    #[display(fmt = "unary-stream")]
    UnaryStream,
    #[display(fmt = "stream-unary")]
    StreamUnary,
    #[display(fmt = "stream-stream")]
    StreamStream,
}

impl Cardinality {
    /// Whether the client may send more than one request message.
    pub fn client_streaming(self) -> bool {
        matches!(self, Self::StreamUnary | Self::StreamStream)
    }

    /// Whether the server may send more than one reply message.
    pub fn server_streaming(self) -> bool {
        matches!(self, Self::UnaryStream | Self::StreamStream)
    }
}

/// A fully qualified method with its cardinality and codecs.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct MethodDescriptor<Req, Res> {
    path: String,
    cardinality: Cardinality,
    #[derivative(Debug = "ignore")]
    request_codec: Arc<dyn Codec<Req>>,
    #[derivative(Debug = "ignore")]
    reply_codec: Arc<dyn Codec<Res>>,
}

impl<Req: 'static, Res> MethodDescriptor<Req, Res> {
    pub fn new(
        path: impl Into<String>,
        cardinality: Cardinality,
        request_codec: impl Codec<Req>,
        reply_codec: impl Codec<Res>,
    ) -> Self {
        Self {
            path: path.into(),
            cardinality,
            request_codec: Arc::new(request_codec),
            reply_codec: Arc::new(reply_codec),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub(crate) fn codec_name(&self) -> &'static str {
        self.request_codec.name()
    }

    pub(crate) fn request_codec(&self) -> Arc<dyn Codec<Req>> {
        self.request_codec.clone()
    }

    pub(crate) fn reply_codec(&self) -> Arc<dyn Codec<Res>> {
        self.reply_codec.clone()
    }
}

/// The remote endpoint of a stream's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    Tcp(std::net::SocketAddr),
    Unix,
    /// An in-process byte stream (tests, embedded transports).
    Local,
}

/// Flags the dispatcher inspects after a handler returns, shared with the
/// stream it handed out.
#[derive(Default)]
pub(crate) struct ServerStreamState {
    pub initial_sent: AtomicBool,
    pub trailers_sent: AtomicBool,
}

pub(crate) struct StreamParts {
    pub conn: ConnectionHandle,
    pub id: NonZeroStreamId,
    pub events_rx: mpsc::UnboundedReceiver<StreamEvent>,
    pub config: Arc<Config>,
    pub sink: Arc<dyn EventSink>,
    pub peer: Peer,
}

/// A cooperative, cancellable, bidirectional message channel carrying one
/// RPC. `Out` is what this side sends, `In` what it receives.
pub struct RpcStream<Out, In> {
    conn: ConnectionHandle,
    id: NonZeroStreamId,
    events_rx: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancelToken,
    _deadline_timer: Option<DeadlineTimer>,
    out_codec: Arc<dyn Codec<Out>>,
    in_codec: Arc<dyn Codec<In>>,
    cardinality: Cardinality,
    side: Side,
    peer: Peer,
    config: Arc<Config>,
    sink: Arc<dyn EventSink>,
    deadline: Option<Deadline>,
    metadata: Metadata,
    content_subtype: String,
    send_compressor: Option<Arc<dyn Compressor>>,
    recv_compressor: Option<Arc<dyn Compressor>>,
    server_state: Option<Arc<ServerStreamState>>,
    reader: MessageReader,
    initial_metadata: Option<Metadata>,
    trailing_metadata: Option<Metadata>,
    final_status: Option<Status>,
    remote_done: bool,
    local_done: bool,
    sent_messages: u64,
    recv_messages: u64,
    finished: bool,
}

/// Builds the client half of a call once the connection opened the stream.
pub(crate) fn new_client<Req: 'static, Res>(
    parts: StreamParts,
    method: &MethodDescriptor<Req, Res>,
    metadata: Metadata,
    deadline: Option<Deadline>,
) -> RpcStream<Req, Res> {
    let cancel = CancelToken::new();
    let deadline_timer = deadline.map(|deadline| {
        let conn = parts.conn.clone();
        let id = parts.id;
        DeadlineTimer::arm_with(&cancel, deadline, move || {
            conn.reset(id, ErrorType::Cancel);
        })
    });
    let send_compressor = parts
        .config
        .send_encoding
        .as_deref()
        .and_then(|name| parts.config.compression.get(name));
    let max = parts.config.max_recv_message_size;
    RpcStream {
        conn: parts.conn,
        id: parts.id,
        events_rx: parts.events_rx,
        cancel,
        _deadline_timer: deadline_timer,
        out_codec: method.request_codec(),
        in_codec: method.reply_codec(),
        cardinality: method.cardinality(),
        side: Side::Client,
        peer: parts.peer,
        config: parts.config,
        sink: parts.sink,
        deadline,
        metadata,
        content_subtype: method.request_codec.name().to_owned(),
        send_compressor,
        recv_compressor: None,
        server_state: None,
        reader: MessageReader::new(max),
        initial_metadata: None,
        trailing_metadata: None,
        final_status: None,
        remote_done: false,
        local_done: false,
        sent_messages: 0,
        recv_messages: 0,
        finished: false,
    }
}

/// Builds the server half of a call for a dispatched handler.
pub(crate) fn new_server<Req, Res>(
    parts: StreamParts,
    request: &RpcRequest,
    half_closed: bool,
    cardinality: Cardinality,
    request_codec: Arc<dyn Codec<Req>>,
    reply_codec: Arc<dyn Codec<Res>>,
    state: Arc<ServerStreamState>,
) -> RpcStream<Res, Req> {
    let cancel = CancelToken::new();
    let deadline_timer = request.deadline.map(|deadline| {
        let conn = parts.conn.clone();
        let id = parts.id;
        DeadlineTimer::arm_with(&cancel, deadline, move || {
            conn.reset(id, ErrorType::Cancel);
        })
    });
    let recv_compressor = request
        .message_encoding
        .as_deref()
        .and_then(|name| parts.config.compression.get(name));
    let send_compressor = parts
        .config
        .send_encoding
        .as_deref()
        .filter(|name| {
            request
                .accept_encoding
                .as_deref()
                .map(|accept| accept.split(',').any(|a| a.trim() == *name))
                .unwrap_or(false)
        })
        .and_then(|name| parts.config.compression.get(name));
    let max = parts.config.max_recv_message_size;
    RpcStream {
        conn: parts.conn,
        id: parts.id,
        events_rx: parts.events_rx,
        cancel,
        _deadline_timer: deadline_timer,
        out_codec: reply_codec,
        in_codec: request_codec,
        cardinality,
        side: Side::Server,
        peer: parts.peer,
        config: parts.config,
        sink: parts.sink,
        deadline: request.deadline,
        metadata: request.metadata.clone(),
        content_subtype: request.content_subtype.clone(),
        send_compressor,
        recv_compressor,
        server_state: Some(state),
        reader: MessageReader::new(max),
        initial_metadata: None,
        trailing_metadata: None,
        final_status: None,
        remote_done: half_closed,
        local_done: false,
        sent_messages: 0,
        recv_messages: 0,
        finished: false,
    }
}

impl<Out: 'static, In: 'static> RpcStream<Out, In> {
    /// The deadline this stream runs under, if any.
    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    /// Request metadata: what was sent (client) or received (server).
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// The cancellation token wrapping this stream's scope. Handlers may
    /// await it to react to deadline expiry or peer cancellation.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Trailing metadata, available once the stream has terminated.
    pub fn trailing_metadata(&self) -> Option<&Metadata> {
        self.trailing_metadata.as_ref()
    }

    fn recv_streaming(&self) -> bool {
        match self.side {
            Side::Client => self.cardinality.server_streaming(),
            Side::Server => self.cardinality.client_streaming(),
        }
    }

    fn send_streaming(&self) -> bool {
        match self.side {
            Side::Client => self.cardinality.client_streaming(),
            Side::Server => self.cardinality.server_streaming(),
        }
    }

    /// Usage errors surface locally and reset the stream; nothing reaches
    /// the peer as a gRPC status.
    fn usage_error(&mut self, message: &str) -> Status {
        let status = Status::internal(message);
        if !self.finished {
            self.conn.reset(self.id, ErrorType::InternalError);
            self.finish(status.clone());
        }
        status
    }

    /// Records the terminal status. Clients reset the stream; a failed
    /// server stream stays open so the dispatcher can put the status on the
    /// wire as trailers.
    fn fail(&mut self, status: Status) -> Status {
        if !self.finished {
            if self.side == Side::Client {
                self.conn.reset(self.id, ErrorType::Cancel);
            }
            self.finish(status.clone());
        }
        status
    }

    fn finish(&mut self, status: Status) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.cancel.cancel(status.clone());
        if self.final_status.is_none() {
            self.final_status = Some(status.clone());
        }
        self.sink.on_event(&Event::StreamClosed {
            stream: self.id.get(),
            code: status.code(),
        });
    }

    /// Sends response headers explicitly (server). Happens implicitly
    /// before the first message otherwise.
    pub fn send_initial_metadata(&mut self, metadata: Metadata) -> Result<(), Status> {
        if self.side != Side::Server {
            return Err(self.usage_error("initial metadata is sent by the call on this side"));
        }
        // unwrap: server streams always carry the shared state
        let state = self.server_state.clone().unwrap();
        if state.initial_sent.swap(true, Ordering::SeqCst) {
            return Err(self.usage_error("initial metadata already sent"));
        }
        let encoding = self.send_compressor.as_ref().map(|c| c.name());
        let headers = build_response_headers(
            &self.content_subtype,
            encoding,
            Some(&self.config.compression.accept_encoding()),
            &metadata,
        );
        self.conn.send_headers(self.id, headers, false);
        self.sink.on_event(&Event::HeadersSent {
            stream: self.id.get(),
        });
        Ok(())
    }

    /// Encodes, frames and enqueues one message, suspending on flow-control
    /// backpressure until the bytes reach the wire.
    pub async fn send_message(&mut self, value: &Out) -> Result<(), Status> {
        if let Some(cause) = self.cancel.cause() {
            return Err(self.fail(cause));
        }
        if self.local_done {
            return Err(self.usage_error("send after the outbound side was closed"));
        }
        if !self.send_streaming() && self.sent_messages >= 1 {
            return Err(self.usage_error("only one message may be sent on this side"));
        }
        if self.side == Side::Server {
            let initial_sent = self
                .server_state
                .as_ref()
                .map(|state| state.initial_sent.load(Ordering::SeqCst))
                .unwrap_or(true);
            if !initial_sent {
                self.send_initial_metadata(Metadata::new())?;
            }
        }
        let payload = self.out_codec.encode(value)?;
        let (compressed, payload) = match &self.send_compressor {
            Some(compressor) => {
                let compressed = compressor
                    .compress(&payload)
                    .map_err(|err| Status::internal(format!("compression failed: {err}")))?;
                (true, Bytes::from(compressed))
            }
            None => (false, payload),
        };
        let mut framed = BytesMut::new();
        encode_message(compressed, &payload, &mut framed);
        let wire_bytes = framed.len();
        match self.send_bytes(framed.freeze(), false).await {
            Ok(()) => {
                self.sent_messages += 1;
                self.sink.on_event(&Event::MessageSent {
                    stream: self.id.get(),
                    wire_bytes,
                });
                Ok(())
            }
            Err(status) => Err(status),
        }
    }

    /// Half-closes the outbound direction (client: "no more requests").
    pub async fn half_close(&mut self) -> Result<(), Status> {
        if self.local_done || self.finished {
            return Ok(());
        }
        self.local_done = true;
        self.send_bytes(Bytes::new(), true).await
    }

    /// One cancellable, flow-controlled write.
    async fn send_bytes(&mut self, data: Bytes, end_stream: bool) -> Result<(), Status> {
        let cancel = self.cancel.clone();
        let conn = self.conn.clone();
        let id = self.id;
        let outcome = tokio::select! {
            biased;
            cause = cancel.cancelled() => Err(cause),
            result = conn.send_data(id, data, end_stream) => Ok(result),
        };
        match outcome {
            Err(cause) => Err(self.fail(cause)),
            Ok(Ok(())) => Ok(()),
            Ok(Err(status)) => {
                self.finish(status.clone());
                Err(status)
            }
        }
    }

    /// Suspends until the peer's initial metadata arrives (client).
    pub async fn recv_initial_metadata(&mut self) -> Result<Metadata, Status> {
        loop {
            if let Some(metadata) = &self.initial_metadata {
                return Ok(metadata.clone());
            }
            if self.remote_done {
                return Err(self
                    .final_status
                    .clone()
                    .unwrap_or_else(|| Status::internal("stream ended without headers")));
            }
            self.pump_event().await?;
        }
    }

    /// The next inbound message, or `None` once the peer finished cleanly.
    /// The stream is a lazy finite sequence: iterate by calling this until
    /// it yields `None`.
    pub async fn recv_message(&mut self) -> Result<Option<In>, Status> {
        loop {
            match self.reader.next() {
                Err(status) => return Err(self.fail(status)),
                Ok(Some((compressed, payload))) => {
                    if !self.recv_streaming() && self.recv_messages >= 1 {
                        return Err(
                            self.usage_error("only one message may be received on this side")
                        );
                    }
                    let wire_bytes = payload.len() + crate::message::MESSAGE_HEADER_LEN;
                    let payload = if compressed {
                        let Some(compressor) = self.recv_compressor.clone() else {
                            return Err(self.fail(Status::internal(
                                "compressed message without negotiated grpc-encoding",
                            )));
                        };
                        match compressor.decompress(&payload) {
                            Ok(decompressed) => Bytes::from(decompressed),
                            Err(err) => {
                                return Err(self.fail(Status::internal(format!(
                                    "decompression failed: {err}"
                                ))));
                            }
                        }
                    } else {
                        payload
                    };
                    let value = match self.in_codec.decode(payload) {
                        Ok(value) => value,
                        Err(status) => return Err(self.fail(status)),
                    };
                    self.recv_messages += 1;
                    self.sink.on_event(&Event::MessageReceived {
                        stream: self.id.get(),
                        wire_bytes,
                    });
                    return Ok(Some(value));
                }
                Ok(None) => {}
            }
            if self.remote_done {
                if !self.reader.is_clean() {
                    return Err(self.fail(Status::internal(
                        "inbound message truncated by end of stream",
                    )));
                }
                return self.end_of_messages();
            }
            self.pump_event().await?;
        }
    }

    /// Terminal bookkeeping once all inbound messages are drained.
    fn end_of_messages(&mut self) -> Result<Option<In>, Status> {
        match self.side {
            // clients never send trailers; a half-close is a clean end
            Side::Server => Ok(None),
            Side::Client => match self.final_status.clone() {
                Some(status) if status.is_ok() => {
                    if !self.finished {
                        self.finished = true;
                        self.sink.on_event(&Event::StreamClosed {
                            stream: self.id.get(),
                            code: status.code(),
                        });
                    }
                    Ok(None)
                }
                Some(status) => {
                    self.finish(status.clone());
                    Err(status)
                }
                None => {
                    let status = Status::internal("stream closed without trailers");
                    self.final_status = Some(status.clone());
                    self.finish(status.clone());
                    Err(status)
                }
            },
        }
    }

    /// Waits for one stream event and folds it into local state.
    async fn pump_event(&mut self) -> Result<(), Status> {
        let cancel = self.cancel.clone();
        let event = tokio::select! {
            biased;
            cause = cancel.cancelled() => Err(cause),
            event = self.events_rx.recv() => Ok(event),
        };
        let event = match event {
            Err(cause) => return Err(self.fail(cause)),
            Ok(event) => event,
        };
        match event {
            None => {
                let status = Status::unavailable("connection closed");
                self.remote_done = true;
                self.finish(status.clone());
                Err(status)
            }
            Some(StreamEvent::Headers {
                headers,
                end_stream,
            }) => self.on_headers(&headers, end_stream),
            Some(StreamEvent::Data { data, end_stream }) => {
                self.conn.consumed(self.id, data.len() as u32);
                self.reader.push(&data);
                if end_stream {
                    self.remote_done = true;
                }
                Ok(())
            }
            Some(StreamEvent::Reset { error }) => {
                self.remote_done = true;
                let status = status_from_reset(error);
                if self.final_status.is_none() {
                    self.final_status = Some(status.clone());
                }
                self.finish(status.clone());
                Err(status)
            }
            Some(StreamEvent::Closed { status }) => {
                self.remote_done = true;
                if status.is_ok() {
                    // benign teardown after a complete exchange
                    Ok(())
                } else {
                    self.finish(status.clone());
                    Err(status)
                }
            }
        }
    }

    fn on_headers(&mut self, headers: &RawHeaders, end_stream: bool) -> Result<(), Status> {
        if self.side == Side::Server {
            // gRPC clients send exactly one HEADERS block
            return Err(self.fail(Status::internal("unexpected trailers from client")));
        }
        self.sink.on_event(&Event::HeadersReceived {
            stream: self.id.get(),
        });
        if has_grpc_status(headers) {
            // trailers, or a trailers-only response
            let (status, metadata) = parse_trailers(headers);
            if self.initial_metadata.is_none() {
                self.initial_metadata = Some(metadata.clone());
            }
            self.trailing_metadata = Some(metadata);
            self.final_status = Some(status);
            self.remote_done = true;
            if !self.local_done {
                // the call ended before we finished sending
                self.conn.reset(self.id, ErrorType::Cancel);
                self.local_done = true;
            }
            return Ok(());
        }
        if self.initial_metadata.is_some() {
            return Err(self.fail(Status::internal("response carried a second header block")));
        }
        let head = match parse_response_headers(headers) {
            Ok(head) => head,
            Err(status) => return Err(self.fail(status)),
        };
        if let Some(encoding) = &head.message_encoding {
            match self.config.compression.get(encoding) {
                Some(compressor) => self.recv_compressor = Some(compressor),
                None if encoding == "identity" => {}
                None => {
                    return Err(self.fail(Status::internal(format!(
                        "peer compresses with unsupported algorithm {encoding:?}"
                    ))));
                }
            }
        }
        self.initial_metadata = Some(head.metadata);
        if end_stream {
            self.remote_done = true;
        }
        Ok(())
    }

    /// Closes the stream with a terminal status (server side). Trailers are
    /// the last thing sent; calling this twice is an error.
    pub fn send_trailing_metadata(
        &mut self,
        status: &Status,
        metadata: Metadata,
    ) -> Result<(), Status> {
        if self.side != Side::Server {
            return Err(self.usage_error("trailers are sent by the server"));
        }
        // unwrap: server streams always carry the shared state
        let state = self.server_state.clone().unwrap();
        if state.trailers_sent.swap(true, Ordering::SeqCst) {
            return Err(Status::internal("trailers already sent"));
        }
        let headers = if state.initial_sent.load(Ordering::SeqCst) {
            build_trailers(status, &metadata)
        } else {
            build_trailers_only(status, &self.content_subtype, &metadata)
        };
        self.conn.send_headers(self.id, headers, true);
        self.local_done = true;
        self.finished = true;
        self.sink.on_event(&Event::StreamClosed {
            stream: self.id.get(),
            code: status.code(),
        });
        Ok(())
    }

    /// Client-side reset with CANCEL. The reason stays local.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        if self.finished {
            return;
        }
        let status = Status::cancelled(reason);
        self.conn.reset(self.id, ErrorType::Cancel);
        self.finish(status);
    }

    /// The terminal status, once observed.
    pub fn final_status(&self) -> Option<&Status> {
        self.final_status.as_ref()
    }
}

impl<Out, In> Drop for RpcStream<Out, In> {
    fn drop(&mut self) {
        // server streams are settled by the dispatcher after the handler
        if self.side == Side::Client && !self.finished && !(self.remote_done && self.local_done) {
            self.conn.reset(self.id, ErrorType::Cancel);
        }
    }
}
