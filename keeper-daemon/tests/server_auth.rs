use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use keeper_core::{PossessionKey, ServiceId};
use keeper_daemon::protocol::{
    decode, encode, handshake_codec, DaemonRequest, DaemonResponse, HandshakeMessage, Hello,
    MAX_FRAME_SIZE,
};
use keeper_daemon::server::{Dispatch, ServerContext, SocketServer};
use keeper_daemon::service::{channel_pair, ClientChannel, SessionId, CHANNEL_CAPACITY};
use keeper_daemon::{DaemonError, ProtocolError, ServiceRunner, ServiceTable};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

type Conn = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Default)]
struct CountingDispatcher {
    opened: AtomicUsize,
}

impl Dispatch for CountingDispatcher {
    fn open_channel(
        &self,
        _service: ServiceId,
        session: SessionId,
    ) -> Result<ClientChannel, ProtocolError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(channel_pair(session).0)
    }

    fn services(&self) -> Vec<ServiceId> {
        ServiceId::ALL.to_vec()
    }
}

struct Harness {
    addr: SocketAddr,
    keys: watch::Sender<Arc<PossessionKey>>,
    shutdown: broadcast::Sender<()>,
    server: JoinHandle<Result<(), DaemonError>>,
}

async fn start(dispatcher: Arc<dyn Dispatch>, key: &str) -> Harness {
    let (keys_tx, keys) = watch::channel(Arc::new(PossessionKey::from(key)));
    let (shutdown, _) = broadcast::channel(4);
    let ctx = ServerContext {
        keys,
        dispatcher,
        shutdown: shutdown.clone(),
        started_at: Utc::now(),
    };
    let server = SocketServer::bind("127.0.0.1:0".parse().expect("addr"), ctx)
        .await
        .expect("bind");
    let addr = server.local_addr();
    let server = tokio::spawn(server.serve());
    Harness {
        addr,
        keys: keys_tx,
        shutdown,
        server,
    }
}

async fn connect(addr: SocketAddr) -> Conn {
    let stream = TcpStream::connect(addr).await.expect("connect");
    Framed::new(stream, handshake_codec())
}

async fn send<T: serde::Serialize>(conn: &mut Conn, message: &T) {
    conn.send(Bytes::from(encode(message).expect("encode")))
        .await
        .expect("send");
}

async fn hello(conn: &mut Conn, key: &str) -> HandshakeMessage {
    send(conn, &HandshakeMessage::Hello(Hello::new(key))).await;
    let frame = conn.next().await.expect("reply").expect("frame");
    decode(&frame).expect("handshake reply")
}

async fn authenticated(addr: SocketAddr, key: &str) -> Conn {
    let mut conn = connect(addr).await;
    let reply = hello(&mut conn, key).await;
    assert!(matches!(reply, HandshakeMessage::HelloAck(_)), "got: {reply:?}");
    conn.codec_mut().set_max_frame_length(MAX_FRAME_SIZE);
    conn
}

async fn request(conn: &mut Conn, request: &DaemonRequest) -> DaemonResponse {
    send(conn, request).await;
    let frame = conn.next().await.expect("response").expect("frame");
    decode(&frame).expect("response json")
}

async fn assert_closed(conn: &mut Conn) {
    match conn.next().await {
        None | Some(Err(_)) => {}
        Some(Ok(frame)) => panic!("expected closed connection, got frame {frame:?}"),
    }
}

#[tokio::test]
async fn wrong_key_is_refused_and_never_dispatched() {
    let dispatcher = Arc::new(CountingDispatcher::default());
    let harness = start(dispatcher.clone(), "right").await;

    for attempt in 0..12 {
        let mut conn = connect(harness.addr).await;
        match attempt % 3 {
            0 => {
                let reply = hello(&mut conn, &format!("wrong-{attempt}")).await;
                assert!(matches!(reply, HandshakeMessage::HelloNack(_)), "got: {reply:?}");
            }
            1 => {
                conn.send(Bytes::from_static(b"{\"type\":\"hello\""))
                    .await
                    .expect("send");
            }
            _ => {
                send(&mut conn, &HandshakeMessage::Hello(Hello::new(""))).await;
                let open = DaemonRequest::Open {
                    service: "code-assist".to_string(),
                };
                // The server may already have hung up.
                let _ = conn.send(Bytes::from(encode(&open).expect("encode"))).await;
            }
        }
        // Whatever came back, the connection ends without a session.
        while let Some(Ok(frame)) = conn.next().await {
            let reply: HandshakeMessage = decode(&frame).expect("only handshake replies");
            assert!(matches!(reply, HandshakeMessage::HelloNack(_)), "got: {reply:?}");
        }
    }
    assert_eq!(dispatcher.opened.load(Ordering::SeqCst), 0);

    // A fresh connection may retry with the right key.
    let mut conn = authenticated(harness.addr, "right").await;
    let response = request(
        &mut conn,
        &DaemonRequest::Open {
            service: "code-assist".to_string(),
        },
    )
    .await;
    assert!(response.ok, "open failed: {:?}", response.error);
    assert_eq!(dispatcher.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn requests_before_hello_are_refused() {
    let dispatcher = Arc::new(CountingDispatcher::default());
    let harness = start(dispatcher.clone(), "right").await;

    let mut conn = connect(harness.addr).await;
    send(
        &mut conn,
        &DaemonRequest::Open {
            service: "tray".to_string(),
        },
    )
    .await;
    let frame = conn.next().await.expect("reply").expect("frame");
    let reply: HandshakeMessage = decode(&frame).expect("nack");
    assert!(matches!(reply, HandshakeMessage::HelloNack(_)));
    assert_closed(&mut conn).await;

    let mut garbage = connect(harness.addr).await;
    garbage
        .send(Bytes::from_static(b"\xff\x00not json"))
        .await
        .expect("send");
    let frame = garbage.next().await.expect("reply").expect("frame");
    assert!(matches!(
        decode::<HandshakeMessage>(&frame).expect("nack"),
        HandshakeMessage::HelloNack(_)
    ));
    assert_closed(&mut garbage).await;

    assert_eq!(dispatcher.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_service_gets_an_error_and_the_connection_closes() {
    let dispatcher = Arc::new(CountingDispatcher::default());
    let harness = start(dispatcher.clone(), "k").await;

    let mut conn = authenticated(harness.addr, "k").await;
    let response = request(
        &mut conn,
        &DaemonRequest::Open {
            service: "preview".to_string(),
        },
    )
    .await;
    assert!(!response.ok);
    assert!(response.error.expect("error").contains("preview"));
    assert_closed(&mut conn).await;
    assert_eq!(dispatcher.opened.load(Ordering::SeqCst), 0);

    // The server keeps serving other connections.
    let mut other = authenticated(harness.addr, "k").await;
    assert!(request(&mut other, &DaemonRequest::Ping).await.ok);
}

#[tokio::test]
async fn swapped_key_takes_effect_for_new_connections() {
    let harness = start(Arc::new(CountingDispatcher::default()), "old").await;
    harness.keys.send_replace(Arc::new(PossessionKey::from("new")));

    let mut stale = connect(harness.addr).await;
    assert!(matches!(hello(&mut stale, "old").await, HandshakeMessage::HelloNack(_)));

    let mut conn = authenticated(harness.addr, "new").await;
    let status = request(&mut conn, &DaemonRequest::Status).await;
    let data = status.into_data().expect("status");
    assert_eq!(data["running"], serde_json::json!(true));
}

#[tokio::test]
async fn opened_sessions_reach_the_service_in_order() {
    let runner = ServiceRunner::new(ServiceTable::standard());
    let harness = start(Arc::new(runner.dispatcher()), "k").await;
    let services = tokio::spawn(runner.run_all(harness.shutdown.clone()));

    let mut echo = authenticated(harness.addr, "k").await;
    let mut tray = authenticated(harness.addr, "k").await;
    for (conn, service) in [(&mut echo, "code-assist"), (&mut tray, "tray")] {
        let response = request(
            conn,
            &DaemonRequest::Open {
                service: service.to_string(),
            },
        )
        .await;
        assert!(response.ok, "open {service}: {:?}", response.error);
    }

    for payload in ["first", "second", "third"] {
        echo.send(Bytes::from(payload)).await.expect("send");
    }
    for expected in ["first", "second", "third"] {
        let frame = echo.next().await.expect("echo").expect("frame");
        assert_eq!(&frame[..], expected.as_bytes());
    }

    tray.send(Bytes::from_static(b"x")).await.expect("send");
    let frame = tray.next().await.expect("ack").expect("frame");
    assert_eq!(&frame[..], b"ack:1");

    harness.shutdown.send(()).expect("shutdown");
    services.await.expect("join").expect("services stop cleanly");
    harness.server.await.expect("join").expect("server stops");
}

#[tokio::test]
async fn shutdown_request_stops_the_server() {
    let harness = start(Arc::new(CountingDispatcher::default()), "k").await;
    let mut conn = authenticated(harness.addr, "k").await;
    let response = request(&mut conn, &DaemonRequest::Shutdown).await;
    assert!(response.ok);
    harness.server.await.expect("join").expect("server stops");
}

#[tokio::test]
async fn pipelined_payloads_are_all_echoed_before_any_read() {
    let runner = ServiceRunner::new(ServiceTable::standard());
    let harness = start(Arc::new(runner.dispatcher()), "k").await;
    let services = tokio::spawn(runner.run_all(harness.shutdown.clone()));

    let mut conn = authenticated(harness.addr, "k").await;
    let response = request(
        &mut conn,
        &DaemonRequest::Open {
            service: "code-assist".to_string(),
        },
    )
    .await;
    assert!(response.ok, "open: {:?}", response.error);

    let total = CHANNEL_CAPACITY * 4 + 10;
    for n in 0..total {
        conn.send(Bytes::from(format!("payload-{n}"))).await.expect("send");
    }
    for n in 0..total {
        let frame = tokio::time::timeout(Duration::from_secs(5), conn.next())
            .await
            .unwrap_or_else(|_| panic!("stalled after {n}/{total} echoes"))
            .expect("echo")
            .expect("frame");
        assert_eq!(&frame[..], format!("payload-{n}").as_bytes());
    }

    harness.shutdown.send(()).expect("shutdown");
    services.await.expect("join").expect("services stop cleanly");
    harness.server.await.expect("join").expect("server stops");
}
