use crate::config::Config;
use crate::connection::{Connection, ConnectionHandle, Side};
use crate::events::{Event, EventSink, NoopEvents};
use crate::metadata::{Deadline, Metadata};
use crate::request::RpcRequest;
use crate::rpc::{self, MethodDescriptor, Peer, RpcStream, StreamParts};
use crate::status::Status;
use log::{debug, trace};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use url::Url;

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub metadata: Metadata,
    pub deadline: Option<Deadline>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Deadline::from_timeout(timeout));
        self
    }
}

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Where a channel dials to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    /// `http://host:port` or `unix:///path/to.sock`.
    pub fn from_url(url: &Url) -> Result<Self, Status> {
        match url.scheme() {
            "http" => Ok(Self::Tcp {
                host: url
                    .host_str()
                    .ok_or_else(|| Status::invalid_argument("endpoint URL has no host"))?
                    .to_owned(),
                port: url
                    .port()
                    .ok_or_else(|| Status::invalid_argument("endpoint URL has no port"))?,
            }),
            "unix" => Ok(Self::Unix(PathBuf::from(url.path()))),
            other => Err(Status::invalid_argument(format!(
                "unsupported endpoint scheme {other:?}"
            ))),
        }
    }

    fn authority(&self) -> String {
        match self {
            Self::Tcp { host, port } => format!("{host}:{port}"),
            Self::Unix(_) => "localhost".to_owned(),
        }
    }

    async fn connect(&self) -> std::io::Result<(Box<dyn Transport>, Peer)> {
        match self {
            Self::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                let peer = stream.peer_addr().map(Peer::Tcp).unwrap_or(Peer::Local);
                Ok((Box::new(stream), peer))
            }
            Self::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                Ok((Box::new(stream), Peer::Unix))
            }
        }
    }
}

/// A lazily connected sub-channel to a single endpoint. All concurrent calls
/// multiplex onto one HTTP/2 connection; once that connection goes away (or
/// drains via GOAWAY), the next call dials a fresh one.
pub struct Channel {
    endpoint: Option<Endpoint>,
    authority: String,
    config: Arc<Config>,
    events: Arc<dyn EventSink>,
    active: Mutex<Option<(ConnectionHandle, Peer)>>,
}

impl Channel {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let endpoint = Endpoint::Tcp {
            host: host.into(),
            port,
        };
        Self::for_endpoint(Some(endpoint))
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::for_endpoint(Some(Endpoint::Unix(path.into())))
    }

    pub fn from_url(url: &Url) -> Result<Self, Status> {
        Ok(Self::for_endpoint(Some(Endpoint::from_url(url)?)))
    }

    /// Wraps an already-established byte stream (a TLS session, an
    /// in-memory pipe). Such a channel cannot redial.
    pub fn from_io<IO>(io: IO) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let channel = Self::for_endpoint(None);
        let (handle, _incoming, _join) = Connection::spawn(
            io,
            Side::Client,
            channel.config.clone(),
            channel.events.clone(),
        );
        *channel.active.try_lock().expect("freshly built channel") = Some((handle, Peer::Local));
        channel
    }

    fn for_endpoint(endpoint: Option<Endpoint>) -> Self {
        let authority = endpoint
            .as_ref()
            .map_or_else(|| "localhost".to_owned(), Endpoint::authority);
        Self {
            endpoint,
            authority,
            config: Arc::new(Config::default()),
            events: Arc::new(NoopEvents),
            active: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    async fn handle(&self) -> Result<(ConnectionHandle, Peer), Status> {
        let mut active = self.active.lock().await;
        if let Some((handle, peer)) = active.as_ref() {
            if handle.is_usable() {
                return Ok((handle.clone(), peer.clone()));
            }
            debug!("connection to {} is gone, redialing", self.authority);
        }
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| Status::unavailable("channel connection is closed"))?;
        let (io, peer) = endpoint
            .connect()
            .await
            .map_err(|err| Status::unavailable(format!("connect failed: {err}")))?;
        let (handle, _incoming, _join) =
            Connection::spawn(io, Side::Client, self.config.clone(), self.events.clone());
        *active = Some((handle.clone(), peer.clone()));
        Ok((handle, peer))
    }

    /// Opens one RPC as a new stream on the shared connection. Suspends when
    /// the peer's concurrent-stream limit is reached, until a slot frees up.
    pub async fn call<Req: 'static, Res: 'static>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        options: CallOptions,
    ) -> Result<RpcStream<Req, Res>, Status> {
        let (handle, peer) = self.handle().await?;
        let request = RpcRequest {
            path: method.path().to_owned(),
            authority: self.authority.clone(),
            scheme: "http".to_owned(),
            content_subtype: method.codec_name().to_owned(),
            metadata: options.metadata.clone(),
            deadline: options.deadline,
            message_encoding: self
                .config
                .send_encoding
                .clone()
                .filter(|name| self.config.compression.supports(name)),
            accept_encoding: Some(self.config.compression.accept_encoding()),
        };
        trace!("call {} deadline {:?}", request.path, options.deadline);
        let opened = handle.open_stream(request.to_wire(), false).await?;
        self.events.on_event(&Event::StreamStarted {
            stream: opened.id.get(),
            path: method.path().to_owned(),
        });
        self.events.on_event(&Event::HeadersSent {
            stream: opened.id.get(),
        });
        let parts = StreamParts {
            conn: handle,
            id: opened.id,
            events_rx: opened.events,
            config: self.config.clone(),
            sink: self.events.clone(),
            peer,
        };
        Ok(rpc::new_client(
            parts,
            method,
            options.metadata,
            options.deadline,
        ))
    }

    /// One request, one reply.
    pub async fn unary<Req: 'static, Res: 'static>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        request: &Req,
        options: CallOptions,
    ) -> Result<Res, Status> {
        let mut stream = self.call(method, options).await?;
        stream.send_message(request).await?;
        stream.half_close().await?;
        let reply = match stream.recv_message().await? {
            Some(reply) => reply,
            None => {
                return Err(Status::internal(
                    "call completed without a response message",
                ));
            }
        };
        // drain the end-of-stream so the terminal status is observed
        if stream.recv_message().await?.is_some() {
            return Err(Status::internal("unary call received a second response"));
        }
        Ok(reply)
    }

    /// Drains the active connection. In-flight calls finish; new calls dial
    /// a fresh connection.
    pub async fn close(&self) {
        if let Some((handle, _)) = self.active.lock().await.take() {
            handle.graceful_close();
        }
    }
}
