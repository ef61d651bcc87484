//! Service Runner: starts every service together and tears the whole set
//! down as soon as one of them crashes.
//!
//! There is no restart policy. A service that errors, panics, or returns
//! before shutdown was requested takes the daemon down with it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keeper_core::ServiceId;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

use crate::error::{DaemonError, ProtocolError};
use crate::server::Dispatch;
use crate::service::{
    channel_pair, ClientChannel, Service, ServiceChannel, ServiceContext, ServiceTable, SessionId,
};

/// How long services get to wind down before they are aborted.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Routes newly opened sessions to the service they asked for.
#[derive(Debug, Clone, Default)]
pub struct ServiceDispatcher {
    acceptors: HashMap<ServiceId, mpsc::UnboundedSender<ServiceChannel>>,
}

impl Dispatch for ServiceDispatcher {
    fn open_channel(
        &self,
        service: ServiceId,
        session: SessionId,
    ) -> Result<ClientChannel, ProtocolError> {
        let acceptor = self
            .acceptors
            .get(&service)
            .ok_or_else(|| ProtocolError::UnknownService(service.to_string()))?;
        let (client, service_end) = channel_pair(session);
        acceptor
            .send(service_end)
            .map_err(|_| ProtocolError::ServiceUnavailable(service))?;
        Ok(client)
    }

    fn services(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.acceptors.keys().copied().collect();
        ids.sort_by_key(|id| id.as_str());
        ids
    }
}

pub struct ServiceRunner {
    table: ServiceTable,
    acceptors: HashMap<ServiceId, mpsc::UnboundedReceiver<ServiceChannel>>,
    dispatcher: ServiceDispatcher,
    stop_grace: Duration,
}

impl ServiceRunner {
    pub fn new(table: ServiceTable) -> Self {
        let mut acceptors = HashMap::new();
        let mut dispatcher = ServiceDispatcher::default();
        for id in table.ids() {
            let (tx, rx) = mpsc::unbounded_channel();
            dispatcher.acceptors.insert(id, tx);
            acceptors.insert(id, rx);
        }
        Self {
            table,
            acceptors,
            dispatcher,
            stop_grace: STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn dispatcher(&self) -> ServiceDispatcher {
        self.dispatcher.clone()
    }

    /// Runs every service until `shutdown` fires or one of them crashes.
    ///
    /// A crash broadcasts `shutdown` to the siblings, waits up to the stop
    /// grace for them, aborts whatever is left, and returns
    /// [`DaemonError::ServiceCrashed`] for the first crash observed.
    ///
    /// Shutdown subscriptions are taken before this returns, so a shutdown
    /// sent any time after the call is never missed.
    pub fn run_all(
        mut self,
        shutdown: broadcast::Sender<()>,
    ) -> impl Future<Output = Result<(), DaemonError>> + Send + 'static {
        let shutdown_rx = shutdown.subscribe();
        let mut contexts = Vec::new();
        for descriptor in self.table.descriptors() {
            let Some(channels) = self.acceptors.remove(&descriptor.id) else {
                continue;
            };
            let ctx = ServiceContext::new(descriptor.id, channels, shutdown.subscribe());
            contexts.push((descriptor.service.clone(), ctx));
        }
        supervise(contexts, shutdown, shutdown_rx, self.stop_grace)
    }
}

async fn supervise(
    contexts: Vec<(Arc<dyn Service>, ServiceContext)>,
    shutdown: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    stop_grace: Duration,
) -> Result<(), DaemonError> {
    let mut tasks = JoinSet::new();
    let mut names = HashMap::new();
    for (service, ctx) in contexts {
        let id = ctx.id;
        let handle = tasks.spawn(service.run(ctx));
        names.insert(handle.id(), id);
        tracing::info!(service = %id, "service started");
    }
    if tasks.is_empty() {
        let _ = shutdown_rx.recv().await;
        return Ok(());
    }

    let mut crash: Option<DaemonError> = None;
    let mut stop_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv(), if stop_deadline.is_none() => {
                tracing::debug!("service runner received shutdown");
                stop_deadline = Some(Instant::now() + stop_grace);
            }
            _ = sleep_until_deadline(stop_deadline) => {
                tracing::warn!(remaining = tasks.len(), "services did not stop in time; aborting");
                tasks.abort_all();
                stop_deadline = None;
                while let Some(joined) = tasks.join_next_with_id().await {
                    if let Err(err) = joined {
                        log_stopped(&names, &err);
                    }
                }
                break;
            }
            joined = tasks.join_next_with_id() => {
                let Some(joined) = joined else { break };
                let stopping = stop_deadline.is_some();
                let failure = match joined {
                    Ok((task, Ok(()))) => {
                        let id = names[&task];
                        if stopping {
                            tracing::info!(service = %id, "service stopped");
                            None
                        } else {
                            Some((id, "exited before shutdown was requested".to_string()))
                        }
                    }
                    Ok((task, Err(err))) => Some((names[&task], err.to_string())),
                    Err(err) if err.is_cancelled() => {
                        log_stopped(&names, &err);
                        None
                    }
                    Err(err) => {
                        let id = names[&err.id()];
                        Some((id, panic_message(err)))
                    }
                };

                if let Some((service, reason)) = failure {
                    if stopping {
                        tracing::warn!(service = %service, reason = %reason, "service failed while stopping");
                    } else {
                        tracing::error!(service = %service, reason = %reason, "service crashed; stopping daemon");
                        crash.get_or_insert(DaemonError::ServiceCrashed { service, reason });
                        let _ = shutdown.send(());
                        stop_deadline = Some(Instant::now() + stop_grace);
                    }
                }
            }
        }
    }

    match crash {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn log_stopped(names: &HashMap<tokio::task::Id, ServiceId>, err: &JoinError) {
    if let Some(id) = names.get(&err.id()) {
        tracing::info!(service = %id, "service aborted");
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(message) = payload.downcast_ref::<&str>() {
                format!("panicked: {message}")
            } else if let Some(message) = payload.downcast_ref::<String>() {
                format!("panicked: {message}")
            } else {
                "panicked".to_string()
            }
        }
        Err(err) => err.to_string(),
    }
}
