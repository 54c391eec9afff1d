use crate::codec::Codec;
use crate::config::Config;
use crate::connection::{Connection, ConnectionHandle, IncomingStream, Side};
use crate::events::{Event, EventSink, NoopEvents};
use crate::metadata::Metadata;
use crate::request::{RequestError, RpcRequest};
use crate::response::{build_http_reject, build_trailers, build_trailers_only};
use crate::rpc::{self, Cardinality, Peer, RpcStream, ServerStreamState, StreamParts};
use crate::status::Status;
use bytes::Bytes;
use derivative::Derivative;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Notify;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), Status>> + Send>>;

struct RawCall {
    parts: StreamParts,
    request: RpcRequest,
    half_closed: bool,
    state: Arc<ServerStreamState>,
}

/// One `/Service/Method` entry: cardinality, codecs and the handler, with
/// the typed plumbing erased so a router can hold any mix of methods.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Method {
    path: String,
    cardinality: Cardinality,
    #[derivative(Debug = "ignore")]
    handler: Box<dyn Fn(RawCall) -> HandlerFuture + Send + Sync>,
}

impl Method {
    pub fn new<Req, Res, F, Fut>(
        path: impl Into<String>,
        cardinality: Cardinality,
        request_codec: impl Codec<Req>,
        reply_codec: impl Codec<Res>,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Res: Send + 'static,
        F: Fn(RpcStream<Res, Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let request_codec: Arc<dyn Codec<Req>> = Arc::new(request_codec);
        let reply_codec: Arc<dyn Codec<Res>> = Arc::new(reply_codec);
        Self {
            path: path.into(),
            cardinality,
            handler: Box::new(move |raw: RawCall| {
                let stream = rpc::new_server(
                    raw.parts,
                    &raw.request,
                    raw.half_closed,
                    cardinality,
                    request_codec.clone(),
                    reply_codec.clone(),
                    raw.state,
                );
                Box::pin(handler(stream))
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }
}

/// A service is an ordered set of methods; a generated skeleton builds one
/// of these per service definition.
#[derive(Debug)]
pub struct ServiceDef {
    name: String,
    methods: Vec<Method>,
}

impl ServiceDef {
    pub fn new(name: impl Into<String>, methods: Vec<Method>) -> Self {
        Self {
            name: name.into(),
            methods,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

struct ServerInner {
    router: HashMap<String, Method>,
    config: Arc<Config>,
    events: Arc<dyn EventSink>,
    shutting_down: AtomicBool,
    conns: Mutex<Vec<ConnectionHandle>>,
    active_streams: AtomicUsize,
    drained: Notify,
}

/// Accepts connections and dispatches streams to registered handlers.
/// Cloning is cheap; clones drive the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(services: Vec<ServiceDef>) -> Self {
        let mut router = HashMap::new();
        for service in services {
            for method in service.methods {
                if let Some(previous) = router.insert(method.path.clone(), method) {
                    warn!("method {} registered twice", previous.path);
                }
            }
        }
        Self {
            inner: Arc::new(ServerInner {
                router,
                config: Arc::new(Config::default()),
                events: Arc::new(NoopEvents),
                shutting_down: AtomicBool::new(false),
                conns: Mutex::new(Vec::new()),
                active_streams: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        // unwrap: configuration happens before the server is shared
        Arc::get_mut(&mut self.inner)
            .expect("configure the server before serving")
            .config = Arc::new(config);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("configure the server before serving")
            .events = events;
        self
    }

    /// Serves until the process dies. See [`Server::serve_with_shutdown`].
    pub async fn serve(&self, addr: std::net::SocketAddr) -> std::io::Result<()> {
        self.serve_with_shutdown(addr, std::future::pending()).await
    }

    /// Serves until `signal` resolves, then shuts down gracefully: new
    /// connections are refused, every connection gets a GOAWAY, streams run
    /// out naturally within the configured grace period.
    pub async fn serve_with_shutdown(
        &self,
        addr: std::net::SocketAddr,
        signal: impl Future<Output = ()>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, signal).await
    }

    /// Serves a pre-bound listener; useful when the caller needs the bound
    /// address (port 0) before serving starts.
    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        signal: impl Future<Output = ()>,
    ) -> std::io::Result<()> {
        debug!("serving on {}", listener.local_addr()?);
        tokio::pin!(signal);
        loop {
            tokio::select! {
                () = &mut signal => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        socket.set_nodelay(true).ok();
                        self.start_connection(socket, Peer::Tcp(addr));
                    }
                    Err(err) => warn!("accept failed: {err}"),
                },
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Unix-domain flavour of [`Server::serve_with_shutdown`].
    pub async fn serve_unix_with_shutdown(
        &self,
        path: impl AsRef<Path>,
        signal: impl Future<Output = ()>,
    ) -> std::io::Result<()> {
        let listener = UnixListener::bind(path)?;
        tokio::pin!(signal);
        loop {
            tokio::select! {
                () = &mut signal => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, _)) => self.start_connection(socket, Peer::Unix),
                    Err(err) => warn!("accept failed: {err}"),
                },
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Runs one already-established byte stream (a TLS session, an
    /// in-memory pipe) as a server connection, until it terminates.
    pub async fn serve_stream<IO>(&self, io: IO, peer: Peer)
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (handle, incoming, _join) = Connection::spawn(
            io,
            Side::Server,
            self.inner.config.clone(),
            self.inner.events.clone(),
        );
        self.register(handle);
        accept_streams(self.inner.clone(), incoming, peer).await;
    }

    fn start_connection<IO>(&self, io: IO, peer: Peer)
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let (handle, incoming, _join) = Connection::spawn(
            io,
            Side::Server,
            self.inner.config.clone(),
            self.inner.events.clone(),
        );
        self.register(handle);
        tokio::spawn(accept_streams(self.inner.clone(), incoming, peer));
    }

    fn register(&self, handle: ConnectionHandle) {
        let mut conns = self.inner.conns.lock().expect("connection list lock");
        conns.retain(ConnectionHandle::is_usable);
        conns.push(handle);
    }

    /// Graceful shutdown: GOAWAY everywhere, drain within the grace period,
    /// then cancel whatever is left.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let conns: Vec<ConnectionHandle> = self
            .inner
            .conns
            .lock()
            .expect("connection list lock")
            .clone();
        for conn in &conns {
            conn.graceful_close();
        }
        let grace = self.inner.config.grace_period;
        tokio::select! {
            () = self.wait_drained() => {}
            () = tokio::time::sleep(grace) => {
                warn!("grace period expired, cancelling remaining streams");
                for conn in &conns {
                    conn.hard_close();
                }
            }
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.active_streams.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn accept_streams(
    inner: Arc<ServerInner>,
    mut incoming: tokio::sync::mpsc::UnboundedReceiver<IncomingStream>,
    peer: Peer,
) {
    while let Some(stream) = incoming.recv().await {
        dispatch(inner.clone(), stream, peer.clone());
    }
}

fn dispatch(inner: Arc<ServerInner>, incoming: IncomingStream, peer: Peer) {
    tokio::spawn(async move {
        let IncomingStream {
            id,
            headers,
            end_stream,
            events,
            handle,
        } = incoming;
        let request = match RpcRequest::from_wire(&headers) {
            Ok(request) => request,
            Err(RequestError::Http { status }) => {
                handle.send_headers(id, build_http_reject(status), true);
                return;
            }
            Err(RequestError::Grpc(status)) => {
                handle.send_headers(
                    id,
                    build_trailers_only(&status, "proto", &Metadata::new()),
                    true,
                );
                return;
            }
        };
        let Some(method) = inner.router.get(&request.path) else {
            debug!("no handler for {}", request.path);
            handle.send_headers(
                id,
                build_trailers_only(
                    &Status::unimplemented(format!("unknown method {}", request.path)),
                    &request.content_subtype,
                    &Metadata::new(),
                ),
                true,
            );
            return;
        };
        if let Some(encoding) = &request.message_encoding {
            if !inner.config.compression.supports(encoding) {
                let mut trailers = build_trailers_only(
                    &Status::unimplemented(format!("unsupported message encoding {encoding:?}")),
                    &request.content_subtype,
                    &Metadata::new(),
                );
                trailers.push((
                    Bytes::from_static(b"grpc-accept-encoding"),
                    inner.config.compression.accept_encoding().into(),
                ));
                handle.send_headers(id, trailers, true);
                return;
            }
        }
        inner.events.on_event(&Event::StreamStarted {
            stream: id.get(),
            path: request.path.clone(),
        });
        inner.active_streams.fetch_add(1, Ordering::SeqCst);
        let content_subtype = request.content_subtype.clone();
        let state = Arc::new(ServerStreamState::default());
        let parts = StreamParts {
            conn: handle.clone(),
            id,
            events_rx: events,
            config: inner.config.clone(),
            sink: inner.events.clone(),
            peer,
        };
        let call = RawCall {
            parts,
            request,
            half_closed: end_stream,
            state: state.clone(),
        };
        // handlers run in their own task so a panic maps to UNKNOWN instead
        // of taking the connection down
        let outcome = tokio::spawn((method.handler)(call)).await;
        let status = match outcome {
            Ok(Ok(())) => Status::ok(),
            Ok(Err(status)) => status,
            Err(join_error) => {
                error!("handler for stream {id} failed: {join_error}");
                if inner.config.expose_unknown_errors {
                    Status::unknown(format!("handler failed: {join_error}"))
                } else {
                    Status::unknown("handler failed")
                }
            }
        };
        if !state.trailers_sent.load(Ordering::SeqCst) {
            let trailers = if state.initial_sent.load(Ordering::SeqCst) {
                build_trailers(&status, &Metadata::new())
            } else {
                build_trailers_only(&status, &content_subtype, &Metadata::new())
            };
            handle.send_headers(id, trailers, true);
            inner.events.on_event(&Event::StreamClosed {
                stream: id.get(),
                code: status.code(),
            });
        }
        if inner.active_streams.fetch_sub(1, Ordering::SeqCst) == 1 {
            inner.drained.notify_waiters();
        }
    });
}

/// Resolves on SIGINT or SIGTERM, exactly once. Opt-in process-level touch:
/// pair it with [`Server::serve_with_shutdown`]; it does not stop the
/// embedding application from installing its own handlers.
pub async fn shutdown_signals() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut interrupt), Ok(mut terminate)) => {
                tokio::select! {
                    _ = interrupt.recv() => {}
                    _ = terminate.recv() => {}
                }
            }
            _ => {
                error!("failed to install signal handlers");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
