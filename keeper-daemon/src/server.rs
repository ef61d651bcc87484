//! Socket Server: accepts local connections, authenticates them against the
//! possession key and bridges authenticated sessions to services.
//!
//! Per connection:
//!
//! ```text
//! Connected -> Authenticating -> Authenticated -> Dispatching -> Closed
//!                    |                 |
//!                    +-> Closed        +-> Closed
//! ```
//!
//! A wrong key, a malformed frame or an unknown service closes that one
//! connection. Nothing a client sends can take the server down.

use std::future::Future;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use keeper_core::{PossessionKey, ServiceId};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{io_err, DaemonError, ProtocolError};
use crate::protocol::{
    decode, encode, handshake_codec, server_info, DaemonRequest, DaemonResponse,
    HandshakeMessage, HelloAck, HelloNack, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
use crate::service::{ClientChannel, SessionId};

/// Unauthenticated connections are dropped after this long.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long in-flight connections get to finish after shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// Routes an authenticated session to a service.
///
/// The server holds no other cross-connection state; implementations must
/// be safe to call from many connection tasks at once.
pub trait Dispatch: Send + Sync + 'static {
    fn open_channel(
        &self,
        service: ServiceId,
        session: SessionId,
    ) -> Result<ClientChannel, ProtocolError>;

    /// Services currently reachable, for status replies.
    fn services(&self) -> Vec<ServiceId>;
}

/// Current possession key. Readers clone an immutable snapshot, so a swap
/// after re-acquisition is never observed half-written.
pub type KeyWatch = watch::Receiver<Arc<PossessionKey>>;

/// Shared, read-only state handed to every connection.
#[derive(Clone)]
pub struct ServerContext {
    pub keys: KeyWatch,
    pub dispatcher: Arc<dyn Dispatch>,
    pub shutdown: broadcast::Sender<()>,
    pub started_at: DateTime<Utc>,
}

/// Binds the daemon endpoint. Any failure here is a resource problem
/// (usually an unmanaged process squatting on the port), reported apart from
/// possession contention.
pub fn bind_endpoint(addr: SocketAddr) -> Result<StdTcpListener, DaemonError> {
    let listener = StdTcpListener::bind(addr).map_err(|source| DaemonError::Bind { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| DaemonError::Bind { addr, source })?;
    Ok(listener)
}

pub struct SocketServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: ServerContext,
}

impl SocketServer {
    /// Wraps a listener from [`bind_endpoint`]. Must run inside a runtime.
    pub fn from_std(listener: StdTcpListener, ctx: ServerContext) -> Result<Self, DaemonError> {
        let addr = listener
            .local_addr()
            .map_err(|source| io_err("daemon endpoint", source))?;
        let listener =
            TcpListener::from_std(listener).map_err(|source| DaemonError::Bind { addr, source })?;
        Ok(Self {
            listener,
            local_addr: addr,
            ctx,
        })
    }

    pub async fn bind(addr: SocketAddr, ctx: ServerContext) -> Result<Self, DaemonError> {
        Self::from_std(bind_endpoint(addr)?, ctx)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until the shutdown channel fires, then stops
    /// accepting and drains in-flight connections.
    ///
    /// Subscribes to shutdown before returning, like the service runner.
    pub fn serve(self) -> impl Future<Output = Result<(), DaemonError>> + Send + 'static {
        let mut shutdown_rx = self.ctx.shutdown.subscribe();
        async move { self.serve_until(&mut shutdown_rx).await }
    }

    async fn serve_until(self, shutdown_rx: &mut broadcast::Receiver<()>) -> Result<(), DaemonError> {
        let mut connections = JoinSet::new();
        tracing::info!(addr = %self.local_addr, "socket server listening");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let session = SessionId::next();
                    let ctx = self.ctx.clone();
                    let shutdown = self.ctx.shutdown.subscribe();
                    connections.spawn(async move {
                        tracing::debug!(%session, %peer, "connection accepted");
                        match handle_connection(stream, session, ctx, shutdown).await {
                            Ok(()) => tracing::debug!(%session, "connection closed"),
                            Err(err) => tracing::info!(%session, error = %err, "connection closed with error"),
                        }
                    });
                }
            }
        }

        drop(self.listener);
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = connections.len(), "aborting connections after drain timeout");
            connections.shutdown().await;
        }
        tracing::info!("socket server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    session: SessionId,
    ctx: ServerContext,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ProtocolError> {
    let _ = stream.set_nodelay(true);
    let mut conn = Framed::new(stream, handshake_codec());

    let authenticated = tokio::select! {
        _ = shutdown.recv() => return Ok(()),
        result = tokio::time::timeout(HANDSHAKE_TIMEOUT, authenticate(&mut conn, &ctx.keys)) => {
            result.map_err(|_| ProtocolError::HandshakeTimeout)?
        }
    };
    authenticated?;
    conn.codec_mut().set_max_frame_length(MAX_FRAME_SIZE);
    tracing::debug!(%session, "session authenticated");

    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            frame = conn.next() => frame,
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let frame = frame?;

        let request: DaemonRequest = match decode(&frame) {
            Ok(request) => request,
            Err(err) => {
                send_response(&mut conn, &DaemonResponse::error(format!("invalid request: {err}"))).await?;
                return Err(err);
            }
        };

        match request {
            DaemonRequest::Ping => {
                send_response(&mut conn, &DaemonResponse::ok(json!({ "pong": true }))).await?;
            }
            DaemonRequest::Status => {
                let payload = status_payload(&ctx);
                send_response(&mut conn, &DaemonResponse::ok(payload)).await?;
            }
            DaemonRequest::Shutdown => {
                tracing::info!(%session, "shutdown requested over socket");
                send_response(&mut conn, &DaemonResponse::ok(json!({ "stopping": true }))).await?;
                let _ = ctx.shutdown.send(());
                return Ok(());
            }
            DaemonRequest::Open { service } => {
                let id = match ServiceId::parse(&service) {
                    Ok(id) => id,
                    Err(err) => {
                        send_response(&mut conn, &DaemonResponse::error(err.to_string())).await?;
                        return Err(ProtocolError::UnknownService(service));
                    }
                };
                let channel = match ctx.dispatcher.open_channel(id, session) {
                    Ok(channel) => channel,
                    Err(err) => {
                        send_response(&mut conn, &DaemonResponse::error(err.to_string())).await?;
                        return Err(err);
                    }
                };
                send_response(&mut conn, &DaemonResponse::ok(json!({ "service": id }))).await?;
                tracing::debug!(%session, service = %id, "session bound to service");
                return pump(conn, channel, shutdown).await;
            }
        }
    }
}

/// Authenticating state: exactly one `Hello` carrying the current key.
async fn authenticate(conn: &mut Connection, keys: &KeyWatch) -> Result<(), ProtocolError> {
    let frame = match conn.next().await {
        Some(frame) => frame?,
        None => return Err(ProtocolError::ConnectionClosed),
    };

    let rejection = match decode::<HandshakeMessage>(&frame) {
        Ok(HandshakeMessage::Hello(hello)) => {
            let key = keys.borrow().clone();
            if hello.protocol_version != PROTOCOL_VERSION {
                Some((
                    format!(
                        "unsupported protocol version {} (server speaks {PROTOCOL_VERSION})",
                        hello.protocol_version
                    ),
                    ProtocolError::Rejected("protocol version mismatch".to_string()),
                ))
            } else if !key.matches(&hello.key) {
                Some(("invalid key".to_string(), ProtocolError::AuthenticationFailed))
            } else {
                None
            }
        }
        Ok(_) => Some((
            "expected hello".to_string(),
            ProtocolError::Malformed("handshake frame was not a hello".to_string()),
        )),
        Err(err) => Some(("malformed hello".to_string(), err)),
    };

    match rejection {
        None => {
            let ack = HandshakeMessage::HelloAck(HelloAck {
                server_info: server_info(),
            });
            conn.send(Bytes::from(encode(&ack)?)).await?;
            Ok(())
        }
        Some((reason, err)) => {
            let nack = HandshakeMessage::HelloNack(HelloNack { reason });
            // The peer may already be gone; the connection closes either way.
            let _ = conn.send(Bytes::from(encode(&nack)?)).await;
            Err(err)
        }
    }
}

/// Dispatching state: opaque payloads flow both ways in arrival order until
/// either side goes away.
///
/// The two directions run independently, so a client that writes without
/// reading never blocks delivery of the service's replies. Client EOF closes
/// the service's inbound side; the session ends once the service drops its
/// outbound side.
async fn pump(
    conn: Connection,
    channel: ClientChannel,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ProtocolError> {
    let ClientChannel {
        to_service,
        mut from_service,
    } = channel;
    let (mut sink, mut stream) = conn.split();

    let inbound = async move {
        while let Some(frame) = stream.next().await {
            if to_service.send(frame?.freeze()).await.is_err() {
                break;
            }
        }
        Ok::<(), ProtocolError>(())
    };
    let outbound = async move {
        while let Some(payload) = from_service.recv().await {
            sink.send(payload).await?;
        }
        Ok::<(), ProtocolError>(())
    };
    tokio::pin!(inbound, outbound);

    let mut inbound_open = true;
    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            result = &mut inbound, if inbound_open => {
                result?;
                inbound_open = false;
            }
            result = &mut outbound => return result,
        }
    }
}

async fn send_response(conn: &mut Connection, response: &DaemonResponse) -> Result<(), ProtocolError> {
    conn.send(Bytes::from(encode(response)?)).await?;
    Ok(())
}

fn status_payload(ctx: &ServerContext) -> Value {
    let uptime = Utc::now()
        .signed_duration_since(ctx.started_at)
        .num_seconds()
        .max(0);
    json!({
        "running": true,
        "pid": std::process::id(),
        "started_at": ctx.started_at.to_rfc3339(),
        "uptime_secs": uptime,
        "services": ctx.dispatcher.services(),
    })
}
