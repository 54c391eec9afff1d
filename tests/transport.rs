#![cfg(feature = "json")]

use grpc2::{
    CallOptions, Cardinality, Channel, JsonCodec, Method, MethodDescriptor, RpcStream, Server,
    ServiceDef, Status,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EchoMessage {
    text: String,
}

fn echo_service() -> ServiceDef {
    ServiceDef::new(
        "test.Echo",
        vec![Method::new(
            "/test.Echo/Echo",
            Cardinality::UnaryUnary,
            JsonCodec::new(),
            JsonCodec::new(),
            |mut stream: RpcStream<EchoMessage, EchoMessage>| async move {
                let request = stream
                    .recv_message()
                    .await?
                    .ok_or_else(|| Status::invalid_argument("missing request"))?;
                stream.send_message(&request).await?;
                Ok(())
            },
        )],
    )
}

fn echo() -> MethodDescriptor<EchoMessage, EchoMessage> {
    MethodDescriptor::new(
        "/test.Echo/Echo",
        Cardinality::UnaryUnary,
        JsonCodec::new(),
        JsonCodec::new(),
    )
}

#[tokio::test]
async fn echo_over_tcp() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = Server::new(vec![echo_service()]);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let serving = {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .serve_listener(listener, async {
                    stop_rx.await.ok();
                })
                .await
        })
    };

    let channel = Channel::new(addr.ip().to_string(), addr.port());
    let reply = channel
        .unary(
            &echo(),
            &EchoMessage {
                text: "ping".to_owned(),
            },
            CallOptions::new(),
        )
        .await?;
    assert_eq!(reply.text, "ping");

    // further calls reuse the same connection
    for index in 0..8 {
        let request = EchoMessage {
            text: format!("call-{index}"),
        };
        let reply = channel.unary(&echo(), &request, CallOptions::new()).await?;
        assert_eq!(reply.text, format!("call-{index}"));
    }

    stop_tx.send(()).ok();
    serving.await??;
    Ok(())
}
