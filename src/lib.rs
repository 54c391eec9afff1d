#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
    clippy::too_many_lines,
)]

mod cancel;
mod client;
mod codec;
mod compression;
mod config;
mod connection;
mod events;
mod flags;
mod frame;
mod message;
mod metadata;
mod request;
mod response;
mod rpc;
mod server;
mod status;
mod stream;
mod types;

pub use bytes::Bytes;
pub use url::Url;

pub use cancel::{CancelToken, DeadlineTimer};
pub use client::{CallOptions, Channel, Endpoint};
pub use codec::{Codec, RawCodec};
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use compression::{CompressionRegistry, Compressor, Deflate, Gzip};
pub use config::Config;
pub use events::{Event, EventSink, NoopEvents};
pub use metadata::{Deadline, Metadata, MetadataValue};
pub use rpc::{Cardinality, MethodDescriptor, Peer, RpcStream};
pub use server::{shutdown_signals, Method, Server, ServiceDef};
pub use status::{Code, Status};
