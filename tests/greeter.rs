#![cfg(feature = "json")]

use grpc2::{
    CallOptions, Cardinality, Channel, Code, JsonCodec, Metadata, Method, MethodDescriptor, Peer,
    RpcStream, Server, ServiceDef, Status,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct HelloRequest {
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct HelloReply {
    message: String,
}

#[derive(Default)]
struct HandlerLog {
    requests: Mutex<Vec<HelloRequest>>,
    stream_names: Mutex<Vec<String>>,
    cancelled: AtomicBool,
}

fn codec_pair() -> (JsonCodec<HelloRequest>, JsonCodec<HelloReply>) {
    (JsonCodec::new(), JsonCodec::new())
}

fn greeter(log: Arc<HandlerLog>) -> ServiceDef {
    let unary_log = log.clone();
    let stream_log = log.clone();
    let sleepy_log = log.clone();
    ServiceDef::new(
        "helloworld.Greeter",
        vec![
            Method::new(
                "/helloworld.Greeter/UnaryUnaryGreeting",
                Cardinality::UnaryUnary,
                JsonCodec::new(),
                JsonCodec::new(),
                move |mut stream: RpcStream<HelloReply, HelloRequest>| {
                    let log = unary_log.clone();
                    async move {
                        let request = stream
                            .recv_message()
                            .await?
                            .ok_or_else(|| Status::invalid_argument("missing request"))?;
                        log.requests.lock().unwrap().push(request.clone());
                        stream
                            .send_message(&HelloReply {
                                message: format!("Hello, {}!", request.name),
                            })
                            .await?;
                        Ok(())
                    }
                },
            ),
            Method::new(
                "/helloworld.Greeter/UnaryStreamGreeting",
                Cardinality::UnaryStream,
                JsonCodec::new(),
                JsonCodec::new(),
                |mut stream: RpcStream<HelloReply, HelloRequest>| async move {
                    let request = stream
                        .recv_message()
                        .await?
                        .ok_or_else(|| Status::invalid_argument("missing request"))?;
                    stream
                        .send_message(&HelloReply {
                            message: format!("Hello, {}!", request.name),
                        })
                        .await?;
                    stream
                        .send_message(&HelloReply {
                            message: format!("Goodbye, {}!", request.name),
                        })
                        .await?;
                    Ok(())
                },
            ),
            Method::new(
                "/helloworld.Greeter/StreamUnaryGreeting",
                Cardinality::StreamUnary,
                JsonCodec::new(),
                JsonCodec::new(),
                move |mut stream: RpcStream<HelloReply, HelloRequest>| {
                    let log = stream_log.clone();
                    async move {
                        let mut names = Vec::new();
                        while let Some(request) = stream.recv_message().await? {
                            log.stream_names.lock().unwrap().push(request.name.clone());
                            names.push(request.name);
                        }
                        stream
                            .send_message(&HelloReply {
                                message: format!("Hello, {}!", names.join(" and ")),
                            })
                            .await?;
                        Ok(())
                    }
                },
            ),
            Method::new(
                "/helloworld.Greeter/StreamStreamGreeting",
                Cardinality::StreamStream,
                JsonCodec::new(),
                JsonCodec::new(),
                |mut stream: RpcStream<HelloReply, HelloRequest>| async move {
                    while let Some(request) = stream.recv_message().await? {
                        stream
                            .send_message(&HelloReply {
                                message: format!("Hello, {}!", request.name),
                            })
                            .await?;
                    }
                    // responses are not coupled to requests
                    stream
                        .send_message(&HelloReply {
                            message: "Goodbye, all!".to_owned(),
                        })
                        .await?;
                    Ok(())
                },
            ),
            Method::new(
                "/helloworld.Greeter/SleepyGreeting",
                Cardinality::UnaryUnary,
                JsonCodec::new(),
                JsonCodec::new(),
                move |mut stream: RpcStream<HelloReply, HelloRequest>| {
                    let log = sleepy_log.clone();
                    async move {
                        let _request = stream.recv_message().await?;
                        let token = stream.cancel_token();
                        tokio::select! {
                            () = tokio::time::sleep(Duration::from_millis(500)) => {
                                stream
                                    .send_message(&HelloReply {
                                        message: "better late than never".to_owned(),
                                    })
                                    .await?;
                                Ok(())
                            }
                            cause = token.cancelled() => {
                                log.cancelled.store(true, Ordering::SeqCst);
                                Err(cause)
                            }
                        }
                    }
                },
            ),
        ],
    )
}

fn start() -> (Server, Channel, Arc<HandlerLog>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let log = Arc::new(HandlerLog::default());
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = Server::new(vec![greeter(log.clone())]);
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_stream(server_io, Peer::Local).await });
    let channel = Channel::from_io(client_io);
    (server, channel, log)
}

fn unary_unary() -> MethodDescriptor<HelloRequest, HelloReply> {
    let (req, res) = codec_pair();
    MethodDescriptor::new(
        "/helloworld.Greeter/UnaryUnaryGreeting",
        Cardinality::UnaryUnary,
        req,
        res,
    )
}

fn unary_stream() -> MethodDescriptor<HelloRequest, HelloReply> {
    let (req, res) = codec_pair();
    MethodDescriptor::new(
        "/helloworld.Greeter/UnaryStreamGreeting",
        Cardinality::UnaryStream,
        req,
        res,
    )
}

fn stream_unary() -> MethodDescriptor<HelloRequest, HelloReply> {
    let (req, res) = codec_pair();
    MethodDescriptor::new(
        "/helloworld.Greeter/StreamUnaryGreeting",
        Cardinality::StreamUnary,
        req,
        res,
    )
}

fn stream_stream() -> MethodDescriptor<HelloRequest, HelloReply> {
    let (req, res) = codec_pair();
    MethodDescriptor::new(
        "/helloworld.Greeter/StreamStreamGreeting",
        Cardinality::StreamStream,
        req,
        res,
    )
}

fn sleepy() -> MethodDescriptor<HelloRequest, HelloReply> {
    let (req, res) = codec_pair();
    MethodDescriptor::new(
        "/helloworld.Greeter/SleepyGreeting",
        Cardinality::UnaryUnary,
        req,
        res,
    )
}

fn hello(name: &str) -> HelloRequest {
    HelloRequest {
        name: name.to_owned(),
    }
}

#[tokio::test]
async fn unary() {
    let (_server, channel, log) = start();
    let reply = channel
        .unary(&unary_unary(), &hello("World"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(reply.message, "Hello, World!");
    assert_eq!(*log.requests.lock().unwrap(), vec![hello("World")]);
}

#[tokio::test]
async fn server_streaming() {
    let (_server, channel, _log) = start();
    let mut stream = channel
        .call(&unary_stream(), CallOptions::new())
        .await
        .unwrap();
    stream.send_message(&hello("World")).await.unwrap();
    stream.half_close().await.unwrap();
    let mut messages = Vec::new();
    while let Some(reply) = stream.recv_message().await.unwrap() {
        messages.push(reply.message);
    }
    assert_eq!(messages, vec!["Hello, World!", "Goodbye, World!"]);
    assert!(stream.final_status().unwrap().is_ok());
}

#[tokio::test]
async fn client_streaming() {
    let (_server, channel, _log) = start();
    let mut stream = channel
        .call(&stream_unary(), CallOptions::new())
        .await
        .unwrap();
    stream.send_message(&hello("A")).await.unwrap();
    stream.send_message(&hello("B")).await.unwrap();
    stream.half_close().await.unwrap();
    let reply = stream.recv_message().await.unwrap().unwrap();
    assert_eq!(reply.message, "Hello, A and B!");
    assert!(stream.recv_message().await.unwrap().is_none());
}

#[tokio::test]
async fn bidirectional_streaming() {
    let (_server, channel, _log) = start();
    let mut stream = channel
        .call(&stream_stream(), CallOptions::new())
        .await
        .unwrap();
    for name in ["Huey", "Dewey", "Louie"] {
        stream.send_message(&hello(name)).await.unwrap();
    }
    stream.half_close().await.unwrap();
    let mut messages = Vec::new();
    while let Some(reply) = stream.recv_message().await.unwrap() {
        messages.push(reply.message);
    }
    assert_eq!(
        messages,
        vec![
            "Hello, Huey!",
            "Hello, Dewey!",
            "Hello, Louie!",
            "Goodbye, all!"
        ]
    );
}

#[tokio::test]
async fn metadata_round_trip() {
    let (_server, channel, _log) = start();
    let mut metadata = Metadata::new();
    metadata.add("x-trace-id", "0xdead").unwrap();
    let reply = channel
        .unary(
            &unary_unary(),
            &hello("Metadata"),
            CallOptions::new().with_metadata(metadata),
        )
        .await
        .unwrap();
    assert_eq!(reply.message, "Hello, Metadata!");
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let (_server, channel, _log) = start();
    let (req, res) = codec_pair();
    let missing = MethodDescriptor::new(
        "/helloworld.Greeter/NoSuchMethod",
        Cardinality::UnaryUnary,
        req,
        res,
    );
    let err = channel
        .unary(&missing, &hello("World"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn deadline_expires() {
    let (_server, channel, log) = start();
    let started = Instant::now();
    let err = channel
        .unary(
            &sleepy(),
            &hello("Slowpoke"),
            CallOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert!(
        elapsed < Duration::from_millis(450),
        "deadline took {elapsed:?}"
    );
    // the handler's suspended operation wakes with the cancellation cause
    for _ in 0..50 {
        if log.cancelled.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(log.cancelled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn oversized_request_is_resource_exhausted() {
    let _ = env_logger::builder().is_test(true).try_init();
    let log = Arc::new(HandlerLog::default());
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let mut config = grpc2::Config::default();
    config.max_recv_message_size = 64;
    let server = Server::new(vec![greeter(log)]).with_config(config);
    tokio::spawn(async move { server.serve_stream(server_io, Peer::Local).await });
    let channel = Channel::from_io(client_io);

    let err = channel
        .unary(
            &unary_unary(),
            &hello(&"x".repeat(512)),
            CallOptions::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
}

#[tokio::test]
async fn graceful_shutdown_drains_in_flight_streams() {
    let (server, channel, log) = start();
    let mut stream = channel
        .call(&stream_unary(), CallOptions::new())
        .await
        .unwrap();
    stream.send_message(&hello("A")).await.unwrap();
    // wait until the handler has demonstrably started processing
    while log.stream_names.lock().unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let shutdown = {
        let server = server.clone();
        tokio::spawn(async move { server.shutdown().await })
    };
    // give the GOAWAY a moment to travel
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the in-flight exchange completes normally
    stream.send_message(&hello("B")).await.unwrap();
    stream.half_close().await.unwrap();
    let reply = stream.recv_message().await.unwrap().unwrap();
    assert_eq!(reply.message, "Hello, A and B!");
    assert!(stream.recv_message().await.unwrap().is_none());
    drop(stream);

    shutdown.await.unwrap();

    // no new streams on this connection succeed
    let err = channel
        .unary(&unary_unary(), &hello("late"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
}
