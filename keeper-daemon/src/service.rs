//! Hosted services and the channels that connect them to client sessions.
//!
//! A [`Service`] runs for the lifetime of the daemon. Each client session
//! that opens the service hands it a fresh [`ServiceChannel`]; channels share
//! nothing, so concurrent sessions on one service are isolated.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use keeper_core::{DaemonRunConfig, ServiceId};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

/// Buffered frames per direction on one channel.
pub const CHANNEL_CAPACITY: usize = 64;

/// Identifies one client session across logs and channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ServiceError(pub String);

impl From<String> for ServiceError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for ServiceError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

pub type ServiceFuture = Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send>>;

/// Long-lived unit of work exposed to clients under a [`ServiceId`].
///
/// `run` should return `Ok(())` once the context reports shutdown. Returning
/// earlier, returning an error or panicking counts as a crash.
pub trait Service: Send + Sync + 'static {
    fn run(self: Arc<Self>, ctx: ServiceContext) -> ServiceFuture;
}

/// Daemon side of one logical channel.
#[derive(Debug)]
pub struct ServiceChannel {
    pub session: SessionId,
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Bytes>,
}

impl ServiceChannel {
    /// Next payload from the client; `None` once the client has gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Sends a payload to the client. Fails once the client has gone.
    pub async fn send(&self, payload: Bytes) -> Result<(), ServiceError> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| ServiceError(format!("session {} closed", self.session)))
    }
}

/// Connection side of one logical channel, held by the socket server.
#[derive(Debug)]
pub struct ClientChannel {
    pub to_service: mpsc::Sender<Bytes>,
    pub from_service: mpsc::Receiver<Bytes>,
}

/// Builds a connected pair of channel ends for `session`.
pub fn channel_pair(session: SessionId) -> (ClientChannel, ServiceChannel) {
    let (to_service, inbound) = mpsc::channel(CHANNEL_CAPACITY);
    let (outbound, from_service) = mpsc::channel(CHANNEL_CAPACITY);
    (
        ClientChannel {
            to_service,
            from_service,
        },
        ServiceChannel {
            session,
            inbound,
            outbound,
        },
    )
}

/// Everything a service gets to do its work.
pub struct ServiceContext {
    pub id: ServiceId,
    channels: mpsc::UnboundedReceiver<ServiceChannel>,
    shutdown: broadcast::Receiver<()>,
}

impl ServiceContext {
    pub fn new(
        id: ServiceId,
        channels: mpsc::UnboundedReceiver<ServiceChannel>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            channels,
            shutdown,
        }
    }

    /// Waits for the next session to open this service. Returns `None` once
    /// the daemon is shutting down.
    pub async fn next_channel(&mut self) -> Option<ServiceChannel> {
        tokio::select! {
            _ = self.shutdown.recv() => None,
            channel = self.channels.recv() => channel,
        }
    }

    /// Resolves when the daemon asks services to stop.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.recv().await;
    }
}

// ---------------------------------------------------------------------------
// Service table
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub service: Arc<dyn Service>,
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Ordered, fixed mapping from service id to implementation.
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    entries: Vec<ServiceDescriptor>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table the daemon ships with.
    pub fn standard() -> Self {
        Self::new()
            .with(ServiceId::CodeAssist, EchoService)
            .with(ServiceId::Tray, TrayService)
    }

    /// Adds or replaces the implementation for `id`.
    pub fn with<S: Service>(mut self, id: ServiceId, service: S) -> Self {
        let descriptor = ServiceDescriptor {
            id,
            service: Arc::new(service),
        };
        match self.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => *entry = descriptor,
            None => self.entries.push(descriptor),
        }
        self
    }

    /// Drops auxiliary services when running minimal.
    pub fn trimmed(&self, config: &DaemonRunConfig) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|entry| config.wants(entry.id))
                .cloned()
                .collect(),
        }
    }

    pub fn ids(&self) -> Vec<ServiceId> {
        self.entries.iter().map(|entry| entry.id).collect()
    }

    pub fn descriptors(&self) -> &[ServiceDescriptor] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Built-in services
// ---------------------------------------------------------------------------

/// Relays every payload back to the session that sent it.
///
/// Hosts the protocol-facing slot; the real completion engine lives outside
/// the daemon and talks through the same channel shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoService;

impl Service for EchoService {
    fn run(self: Arc<Self>, ctx: ServiceContext) -> ServiceFuture {
        Box::pin(serve_channels(ctx, |mut channel| async move {
            while let Some(payload) = channel.recv().await {
                if channel.send(payload).await.is_err() {
                    break;
                }
            }
        }))
    }
}

/// Acknowledges each payload with `ack:<n>` where `n` counts payloads on
/// that session.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrayService;

impl Service for TrayService {
    fn run(self: Arc<Self>, ctx: ServiceContext) -> ServiceFuture {
        Box::pin(serve_channels(ctx, |mut channel| async move {
            let mut seen = 0u64;
            while let Some(payload) = channel.recv().await {
                seen += 1;
                tracing::debug!(session = %channel.session, bytes = payload.len(), "tray message");
                if channel.send(Bytes::from(format!("ack:{seen}"))).await.is_err() {
                    break;
                }
            }
        }))
    }
}

/// Accepts channels until shutdown, running `handle` for each on its own
/// task. Channel tasks are aborted when the service stops.
pub async fn serve_channels<F, Fut>(mut ctx: ServiceContext, handle: F) -> Result<(), ServiceError>
where
    F: Fn(ServiceChannel) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut sessions = JoinSet::new();
    while let Some(channel) = ctx.next_channel().await {
        tracing::debug!(service = %ctx.id, session = %channel.session, "channel opened");
        sessions.spawn(handle(channel));
        while sessions.try_join_next().is_some() {}
    }
    sessions.shutdown().await;
    Ok(())
}
