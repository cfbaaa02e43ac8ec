//! Listening socket, accept loop and shutdown sequence.

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    signal::unix::{Signal, SignalKind, signal},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    error::{Error, Result},
    registry::WorkerRegistry,
    shutdown::ShutdownToken,
    store::LogStore,
    timestamp,
    worker::{self, ConnectionId, WorkerLimits},
};

/// Binds the wildcard listening socket with `SO_REUSEADDR` and starts
/// listening.
///
/// Plain blocking-world setup so it can run before the runtime exists and
/// before the process detaches.
pub fn bind_listener(config: &ServerConfig) -> Result<std::net::TcpListener> {
    let addr = config.listen_addr();

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| Error::startup("creating socket", err))?;
    socket
        .set_reuse_address(true)
        .map_err(|err| Error::startup("enabling address reuse", err))?;
    socket
        .bind(&addr.into())
        .map_err(|err| Error::startup("binding listener", err))?;
    socket
        .listen(config.backlog)
        .map_err(|err| Error::startup("listening", err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| Error::startup("configuring listener", err))?;

    Ok(socket.into())
}

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
}

impl Server {
    /// Binds according to `config`. Must be called inside a runtime.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let listener = bind_listener(&config)?;
        Self::from_std(listener, config)
    }

    /// Adopts a listener from [`bind_listener`]. Must be called inside a
    /// runtime.
    pub fn from_std(listener: std::net::TcpListener, config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::from_std(listener)
            .map_err(|err| Error::startup("registering listener", err))?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until SIGINT or SIGTERM, then shuts down.
    ///
    /// Signals arriving while the shutdown sequence runs are logged and
    /// otherwise ignored.
    pub async fn run_until_signal(self) -> Result<()> {
        let mut signals = ShutdownSignals::register()?;
        let (first_tx, first_rx) = oneshot::channel::<()>();

        let watcher = tokio::spawn(async move {
            let Some(name) = signals.recv().await else {
                return;
            };
            info!("caught {name}");
            let _ = first_tx.send(());

            while let Some(name) = signals.recv().await {
                warn!("caught {name} while shutting down, still draining");
            }
        });

        let outcome = self
            .run_until(async move {
                let _ = first_rx.await;
            })
            .await;

        watcher.abort();
        let _ = watcher.await;
        outcome
    }

    /// Serves until `shutdown` resolves.
    ///
    /// Returns `Ok(())` when `shutdown` ended the run and the error when a
    /// fatal accept failure did. The shutdown sequence runs either way.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { listener, config } = self;
        let addr = listener
            .local_addr()
            .map_err(|err| Error::startup("reading listener address", err))?;

        let store = LogStore::create(&config.data_path)
            .await
            .map(Arc::new)
            .map_err(|err| match err {
                Error::Io(source) => Error::startup("creating log store", source),
                other => other,
            })?;

        let token = ShutdownToken::new();
        let trigger = spawn_shutdown_trigger(shutdown, token.clone());
        let timer = config
            .timestamp_interval
            .and_then(|period| timestamp::spawn(period, Arc::clone(&store), token.clone()));

        info!(%addr, path = %store.path().display(), "listening");

        let mut registry = WorkerRegistry::new();
        let outcome = accept_loop(&listener, &token, &store, &config, &mut registry).await;

        token.trigger();
        drop(listener);
        debug!("stopped listening");

        shut_down(&config, &store, registry, timer, trigger, outcome.is_ok()).await;
        outcome
    }
}

struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    fn register() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())
                .map_err(|err| Error::startup("registering for SIGINT", err))?,
            terminate: signal(SignalKind::terminate())
                .map_err(|err| Error::startup("registering for SIGTERM", err))?,
        })
    }

    /// Name of the next signal, or `None` once neither stream can deliver.
    async fn recv(&mut self) -> Option<&'static str> {
        select! {
            Some(()) = self.interrupt.recv() => Some("SIGINT"),
            Some(()) = self.terminate.recv() => Some("SIGTERM"),
            else => None,
        }
    }
}

/// The signal side of shutdown: flip the token, nothing else.
fn spawn_shutdown_trigger<F>(shutdown: F, token: ShutdownToken) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        shutdown.await;
        token.trigger();
    })
}

async fn accept_loop(
    listener: &TcpListener,
    token: &ShutdownToken,
    store: &Arc<LogStore>,
    config: &ServerConfig,
    registry: &mut WorkerRegistry,
) -> Result<()> {
    let limits = WorkerLimits {
        read_buffer_size: config.read_buffer_size,
        max_record_len: config.max_record_len,
    };
    let mut next_id = 0u64;

    loop {
        registry.reap().await;
        debug!(live = registry.len(), "waiting for connection");

        let accepted = select! {
            _ = token.triggered() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if token.is_triggered() {
                    warn!(%peer, error = %Error::ShutdownInProgress, "refusing connection");
                    return Ok(());
                }
                next_id += 1;
                spawn_worker(ConnectionId(next_id), stream, peer, store, limits, registry).await;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                if token.is_triggered() {
                    return Ok(());
                }
            }
            Err(err) => {
                error!(error = %err, "accept failed");
                return Err(err.into());
            }
        }
    }
}

async fn spawn_worker(
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    store: &Arc<LogStore>,
    limits: WorkerLimits,
    registry: &mut WorkerRegistry,
) {
    info!(%id, %peer, "accepted connection");

    let close = ShutdownToken::new();
    let handle = tokio::spawn(worker::run(
        id,
        peer,
        stream,
        Arc::clone(store),
        close.clone(),
        limits,
    ));

    if let Err((err, handle)) = registry.register(id, peer, handle, close.clone()) {
        warn!(%id, %peer, error = %err, "worker not registered, closing it");
        close.trigger();
        if let Err(err) = handle.await {
            error!(%id, error = %err, "unregistered worker failed");
        }
    }
}

/// Each step runs even if an earlier one failed.
async fn shut_down(
    config: &ServerConfig,
    store: &LogStore,
    mut registry: WorkerRegistry,
    timer: Option<JoinHandle<()>>,
    trigger: JoinHandle<()>,
    remove_log: bool,
) {
    let joined = registry.drain_all(config.drain_grace).await;
    info!(joined, "all workers joined");

    if let Some(timer) = timer {
        if let Err(err) = timer.await {
            error!(error = %err, "timestamp writer failed");
        }
    }

    trigger.abort();
    if let Err(err) = trigger.await {
        if !err.is_cancelled() {
            error!(error = %err, "shutdown trigger failed");
        }
    }

    store.teardown();

    if remove_log {
        match store.remove_backing_file().await {
            Ok(()) => info!(path = %store.path().display(), "removed log file"),
            Err(err) => error!(path = %store.path().display(), error = %err, "failed to remove log file"),
        }
    }
}
