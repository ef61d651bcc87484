//! Daemon Runner: possession, endpoint, services, readiness line, shutdown.
//!
//! The sequence is fixed:
//!
//! 1. `--force`: terminate the recorded owner and clear its record.
//! 2. Acquire possession. Contention prints `Already running at <port>`.
//! 3. Bind the endpoint. Failure abandons possession, restoring whatever
//!    record was there before.
//! 4. Start the socket server and every service on one runtime.
//! 5. Re-check the record; a rival overwrite during the startup window is
//!    undone with a fresh key.
//! 6. Print `Running at <port>` and block until shutdown or a crash. The
//!    record is re-checked every [`RECORD_CHECK_INTERVAL`] and rewritten if
//!    it went missing or was replaced by a candidate that never went live.
//! 7. Release possession.

use std::io::{self, Write};
use std::net::TcpListener as StdTcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keeper_core::{
    DaemonRunConfig, OwnerIdentity, PossessionError, PossessionKey, PossessionLock,
    PossessionRecord,
};
use tokio::sync::{broadcast, watch};

use crate::error::{io_err, DaemonError};
use crate::launch::{ALREADY_RUNNING_PREFIX, RUNNING_PREFIX};
use crate::logging::init_tracing;
use crate::paths::{self, endpoint};
use crate::probe::{SocketKiller, SocketProbe};
use crate::server::{bind_endpoint, ServerContext, SocketServer};
use crate::service::ServiceTable;
use crate::supervisor::ServiceRunner;

type Lock = PossessionLock<SocketProbe>;

pub const RECORD_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub config: DaemonRunConfig,
    pub port: u16,
    pub lock_path: PathBuf,
    pub force: bool,
}

impl DaemonSettings {
    /// Port and lock file from the environment, see [`paths`].
    pub fn from_env(config: DaemonRunConfig, force: bool) -> Self {
        Self {
            config,
            port: paths::port(),
            lock_path: paths::lock_path(),
            force,
        }
    }
}

pub struct DaemonRunner {
    settings: DaemonSettings,
    table: ServiceTable,
    probe: SocketProbe,
    killer: SocketKiller,
    announcer: Box<dyn Write + Send>,
}

impl DaemonRunner {
    pub fn new(settings: DaemonSettings, table: ServiceTable) -> Self {
        Self {
            settings,
            table,
            probe: SocketProbe::default(),
            killer: SocketKiller::default(),
            announcer: Box::new(io::stdout()),
        }
    }

    /// Where the readiness line goes. Defaults to stdout.
    pub fn with_announcer(mut self, announcer: Box<dyn Write + Send>) -> Self {
        self.announcer = announcer;
        self
    }

    /// Runs the daemon on the calling thread until it stops.
    pub fn run(mut self) -> Result<(), DaemonError> {
        let settings = self.settings.clone();
        let mut lock = PossessionLock::new(&settings.lock_path, settings.port, self.probe);

        if settings.force {
            if let Err(err) = lock.force_clear(&self.killer) {
                tracing::warn!(error = %err, "force clear failed; attempting acquisition anyway");
            }
        }

        let record = match lock.acquire(OwnerIdentity::current()) {
            Ok(record) => record,
            Err(err) => {
                if let PossessionError::AlreadyOwned { port, .. } = &err {
                    self.announce(&format!("{ALREADY_RUNNING_PREFIX}{port}"));
                }
                return Err(err.into());
            }
        };

        let listener = match bind_endpoint(endpoint(settings.port)) {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(error = %err, "failed to bind daemon endpoint");
                if let Err(abandon_err) = lock.abandon() {
                    tracing::warn!(error = %abandon_err, "could not restore possession record");
                }
                return Err(err);
            }
        };

        let result = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| io_err("tokio-runtime", e))
            .and_then(|runtime| runtime.block_on(self.serve(listener, &mut lock, record)));

        lock.release();
        if let Err(err) = &result {
            tracing::error!(error = %err, "daemon stopped with error");
        }
        result
    }

    async fn serve(
        &mut self,
        listener: StdTcpListener,
        lock: &mut Lock,
        record: PossessionRecord,
    ) -> Result<(), DaemonError> {
        let (shutdown_tx, _) = broadcast::channel::<()>(16);
        let runner = ServiceRunner::new(self.table.trimmed(&self.settings.config));
        let (key_tx, keys) = watch::channel(Arc::new(record.key));
        let record_shutdown = shutdown_tx.subscribe();

        let server = SocketServer::from_std(
            listener,
            ServerContext {
                keys,
                dispatcher: Arc::new(runner.dispatcher()),
                shutdown: shutdown_tx.clone(),
                started_at: Utc::now(),
            },
        )?;

        let services_handle = {
            let shutdown = shutdown_tx.clone();
            let services = runner.run_all(shutdown.clone());
            tokio::spawn(async move {
                let result = services.await;
                let _ = shutdown.send(());
                result
            })
        };

        let server_handle = {
            let shutdown = shutdown_tx.clone();
            let serving = server.serve();
            tokio::spawn(async move {
                let result = serving.await;
                let _ = shutdown.send(());
                result
            })
        };

        let signal_handle = {
            let shutdown = shutdown_tx.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown_rx.recv() => Ok(()),
                    signal = wait_for_signal() => {
                        let _ = shutdown.send(());
                        signal.map_err(|e| io_err("signal handler", e))
                    }
                }
            })
        };

        let reconciled = match tokio::task::block_in_place(|| lock.reconcile()) {
            Ok(None) => Ok(()),
            Ok(Some(record)) => {
                key_tx.send_replace(Arc::new(record.key));
                tracing::info!("possession key rotated after startup reconcile");
                Ok(())
            }
            Err(err) => {
                let _ = shutdown_tx.send(());
                Err(DaemonError::from(err))
            }
        };

        if reconciled.is_ok() {
            tracing::info!(
                port = self.settings.port,
                minimal = !self.settings.config.run_child_processes,
                "daemon ready",
            );
            self.announce(&format!("{RUNNING_PREFIX}{}", self.settings.port));
        }

        let watched = if reconciled.is_ok() {
            watch_record(lock, &key_tx, &shutdown_tx, record_shutdown).await
        } else {
            Ok(())
        };

        let (services_result, server_result, signal_result) =
            tokio::join!(services_handle, server_handle, signal_handle);

        reconciled?;
        watched?;
        handle_join("services", services_result)?;
        handle_join("socket_server", server_result)?;
        handle_join("signal_handler", signal_result)?;
        tracing::info!("daemon stopped");
        Ok(())
    }

    fn announce(&mut self, line: &str) {
        // The reader may be gone (background parent exited); that is not an error.
        let _ = writeln!(self.announcer, "{line}");
        let _ = self.announcer.flush();
    }
}

/// Keeps the on-disk record pointing at this daemon until shutdown.
///
/// A record that vanished or was overwritten by a candidate that never went
/// live is rewritten with a fresh key, which new connections then require.
/// Losing the record to another live owner stops the daemon.
async fn watch_record(
    lock: &mut Lock,
    keys: &watch::Sender<Arc<PossessionKey>>,
    shutdown: &broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut ticker = tokio::time::interval(RECORD_CHECK_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            _ = ticker.tick() => {}
        }
        match tokio::task::block_in_place(|| lock.reconcile()) {
            Ok(None) => {}
            Ok(Some(record)) => {
                keys.send_replace(Arc::new(record.key));
                tracing::info!("possession record repaired; key rotated");
            }
            Err(err) if err.is_contention() => {
                tracing::error!(error = %err, "possession taken over by another daemon");
                let _ = shutdown.send(());
                return Err(err.into());
            }
            Err(err) => tracing::warn!(error = %err, "possession record check failed"),
        }
    }
}

/// Installs logging and runs the daemon with the standard service table.
pub fn start_blocking(settings: DaemonSettings) -> Result<(), DaemonError> {
    let log_file = paths::data_dir().map(|dir| paths::daemon_log_path(&dir));
    init_tracing(settings.config.debug, log_file.as_deref());
    DaemonRunner::new(settings, ServiceTable::standard()).run()
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down daemon");
            result
        }
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down daemon");
            Ok(())
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("received ctrl-c, shutting down daemon");
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::TaskFailed(format!("{task}: {err}"))),
    }
}
