//! WebSocket upgrades relayed through a real gateway connection.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gatehouse_core::transport::{HttpTransport, TransportConfig};
use gatehouse_proxy::{EndpointConfig, EvalContext, GatewayService};
use http::header::{CONNECTION, UPGRADE};
use http::{Request, Response, StatusCode};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;

/// Accepts every upgrade and echoes the upgraded stream.
async fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let svc = service_fn(|mut req: Request<Incoming>| async move {
                    let marker = req.headers().get("x-ws").cloned();
                    let pending = hyper::upgrade::on(&mut req);
                    tokio::spawn(async move {
                        let upgraded = pending.await.unwrap();
                        let (mut rx, mut tx) = tokio::io::split(TokioIo::new(upgraded));
                        let _ = tokio::io::copy(&mut rx, &mut tx).await;
                    });

                    let mut res = Response::builder()
                        .status(StatusCode::SWITCHING_PROTOCOLS)
                        .header(CONNECTION, "upgrade")
                        .header(UPGRADE, "websocket");
                    if let Some(marker) = marker {
                        res = res.header("x-ws-seen", marker);
                    }
                    Ok::<_, Infallible>(res.body(Empty::<Bytes>::new()).unwrap())
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .with_upgrades()
                    .await;
            });
        }
    });
    addr
}

async fn gateway(backend: SocketAddr) -> SocketAddr {
    let yaml = format!(
        "proxies:\n  - policy:\n      backends: [\"http://{backend}\"]\n      websockets:\n        - timeout: 10s\n          request:\n            set:\n              x-ws: \"on\"\n"
    );
    let conf: EndpointConfig = serde_saphyr::from_str(&yaml).unwrap();
    let transport = Arc::new(HttpTransport::new(TransportConfig::default()).unwrap());
    let service = GatewayService::new(conf.build(transport, EvalContext::default()).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| service.clone().oneshot(req));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .with_upgrades()
                    .await;
            });
        }
    });
    addr
}

/// Read a response head byte by byte so no relayed bytes are consumed.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap().to_ascii_lowercase()
}

#[tokio::test]
async fn test_upgrade_relays_both_directions() {
    let backend = echo_backend().await;
    let gateway = gateway(backend).await;

    let relay = async {
        let mut stream = TcpStream::connect(gateway).await.unwrap();
        stream
            .write_all(
                b"GET /chat HTTP/1.1\r\nHost: gw.local\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
            )
            .await
            .unwrap();

        let head = read_head(&mut stream).await;
        assert!(head.starts_with("http/1.1 101"), "{head}");
        assert!(head.contains("x-ws-seen: on"), "{head}");

        for frame in [&b"ping"[..], &b"second frame"[..]] {
            stream.write_all(frame).await.unwrap();
            let mut echoed = vec![0u8; frame.len()];
            stream.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, frame);
        }
    };

    tokio::time::timeout(Duration::from_secs(10), relay)
        .await
        .expect("upgraded connection stalled");
}
