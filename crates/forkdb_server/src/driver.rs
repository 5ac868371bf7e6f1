//! Server driver.
//!
//! [`serve`] runs one server from validation to release:
//!
//! 1. validate the configuration (nothing is bound on failure)
//! 2. bind the listener and signal the start outcome
//! 3. accept connections until a stop is requested
//! 4. drop the listener, close idle connections, give in-flight statements
//!    the grace period, abort what is left
//! 5. signal close
//!
//! Close is signalled from a drop guard, so it also happens when the driver
//! returns early, unwinds, or has its task aborted. On the normal stop path the
//! guard fires only after every connection task has been joined. When the
//! driver task itself is aborted, connection tasks are only asked to abort, so
//! their sockets may outlive the close signal briefly.

use crate::config::{ConfigSources, ServerConfig};
use crate::controller::ServerController;
use crate::dispatch::Dispatcher;
use crate::engine::{BranchStore, MemoryBranchStore, QueryEngine, UnsupportedEngine};
use crate::error::{ConfigErrors, ServerError, ServerResult, StartError};
use crate::frontend::{self, Connection, Shared};
use crate::session::{ConnectionId, DefaultBranch};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The collaborators a server runs against.
#[derive(Clone)]
pub struct Backend {
    /// Executes statements the server does not answer itself.
    pub engine: Arc<dyn QueryEngine>,
    /// Knows which branches and commits exist.
    pub store: Arc<dyn BranchStore>,
}

impl Backend {
    /// Creates a backend from an engine and a store.
    pub fn new(engine: Arc<dyn QueryEngine>, store: Arc<dyn BranchStore>) -> Self {
        Self { engine, store }
    }

    /// An in-memory store with a `main` branch and an engine that rejects
    /// every statement.
    pub fn memory() -> Self {
        Self::new(
            Arc::new(UnsupportedEngine),
            Arc::new(MemoryBranchStore::default()),
        )
    }

    fn default_branch(&self, config: Option<&ServerConfig>) -> Arc<DefaultBranch> {
        let initial = config
            .and_then(|c| c.default_branch().cloned())
            .unwrap_or_else(|| self.store.initial_branch());
        Arc::new(DefaultBranch::new(initial))
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("branches", &self.store.branches())
            .finish_non_exhaustive()
    }
}

/// Signals close when dropped.
///
/// Dropped after the `Acceptor`. If the driver future is dropped mid-run the
/// `JoinSet` can only request that connection tasks abort; it cannot wait.
struct CloseGuard {
    controller: Arc<ServerController>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        // Errors are logged by the controller.
        if self.controller.signal_closed().is_ok() {
            info!("server closed");
        }
    }
}

/// Runs a server until a stop is requested on `controller`.
///
/// The start outcome is delivered through the controller as well as the
/// returned error; close is always signalled before this returns.
pub async fn serve(
    config: ServerConfig,
    controller: Arc<ServerController>,
    backend: Backend,
) -> ServerResult<()> {
    let default_branch = backend.default_branch(Some(&config));
    drive(Ok(config), controller, backend, default_branch).await
}

/// Like [`serve`], but resolves the configuration from raw sources first.
///
/// Configuration errors are reported through the start outcome.
pub async fn serve_sources(
    sources: ConfigSources,
    controller: Arc<ServerController>,
    backend: Backend,
) -> ServerResult<()> {
    let config = sources.resolve();
    let default_branch = backend.default_branch(config.as_ref().ok());
    drive(config, controller, backend, default_branch).await
}

async fn drive(
    config: Result<ServerConfig, ConfigErrors>,
    controller: Arc<ServerController>,
    backend: Backend,
    default_branch: Arc<DefaultBranch>,
) -> ServerResult<()> {
    controller.begin_start()?;
    // Declared first so it drops last, after the listener and the tasks.
    let _close = CloseGuard {
        controller: Arc::clone(&controller),
    };

    let config = match config.and_then(|c| c.validate().map(|()| c)) {
        Ok(config) => config,
        Err(errors) => {
            error!(error = %errors, "invalid server configuration");
            controller.signal_start_failed(StartError::Config(errors.clone()))?;
            return Err(ServerError::Config(errors));
        }
    };
    debug!(?config, "starting server");

    if controller.is_stop_requested() {
        info!("stop requested before startup, not binding");
        controller.signal_start_failed(StartError::Cancelled)?;
        return Err(StartError::Cancelled.into());
    }

    let addr = config.bind_addr();
    let listener = match bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, error = %err, "failed to start server");
            controller.signal_start_failed(err.clone())?;
            return Err(err.into());
        }
    };
    let local_addr = listener.local_addr()?;
    controller.signal_started(local_addr)?;
    info!(addr = %local_addr, read_only = config.read_only(), "server listening");

    let shared = Arc::new(Shared {
        dispatcher: Dispatcher::new(backend.engine, backend.store, default_branch, &config),
        user: config.user().to_string(),
        password: config.password().to_string(),
        write_limit: config.write_limit(),
        handshake_limit: config.handshake_limit(),
    });
    let mut acceptor = Acceptor {
        shared,
        limiter: Arc::new(Semaphore::new(
            config.max_connections().min(Semaphore::MAX_PERMITS),
        )),
        max_connections: config.max_connections(),
        shutdown: CancellationToken::new(),
        tasks: JoinSet::new(),
        next_id: 1,
    };

    loop {
        tokio::select! {
            biased;
            _ = controller.stop_requested() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => acceptor.admit(stream, peer),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = acceptor.tasks.join_next(), if !acceptor.tasks.is_empty() => {
                log_join(joined);
            }
        }
    }

    drop(listener);
    info!(
        connections = acceptor.tasks.len(),
        "server stopping, listener closed"
    );
    acceptor.drain(config.shutdown_grace()).await;
    Ok(())
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, StartError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| StartError::bind(addr, &e))
}

/// Owns every connection task of one run.
struct Acceptor {
    shared: Arc<Shared>,
    limiter: Arc<Semaphore>,
    max_connections: usize,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
    next_id: ConnectionId,
}

impl Acceptor {
    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let Ok(permit) = Arc::clone(&self.limiter).try_acquire_owned() else {
            warn!(
                %peer,
                max_connections = self.max_connections,
                "connection limit reached, rejecting"
            );
            self.tasks.spawn(async move {
                if let Err(e) = frontend::reject(stream, "too many connections").await {
                    debug!(%peer, error = %e, "failed to notify rejected client");
                }
            });
            return;
        };

        let connection = Connection::new(stream, id, Arc::clone(&self.shared));
        let shutdown = self.shutdown.clone();
        let span = info_span!("connection", connection_id = id, %peer);
        self.tasks.spawn(
            async move {
                let _permit = permit;
                info!("connection accepted");
                match connection.run(shutdown).await {
                    Ok(()) => info!("connection closed"),
                    Err(e) => info!(error = %e, "connection closed with error"),
                }
            }
            .instrument(span),
        );
    }

    /// Closes idle connections, waits up to `grace` for busy ones, then
    /// aborts whatever is still running.
    async fn drain(mut self, grace: Duration) {
        self.shutdown.cancel();

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.tasks.len(),
                grace_ms = grace.as_millis() as u64,
                "grace period elapsed, aborting connections"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "connection task panicked");
        }
    }
}

/// A server running on the tokio runtime.
///
/// Dropping the handle does not stop the server; call [`stop`](Self::stop).
#[derive(Debug)]
pub struct ServerHandle {
    controller: Arc<ServerController>,
    default_branch: Arc<DefaultBranch>,
    task: JoinHandle<ServerResult<()>>,
}

impl ServerHandle {
    /// Spawns a server. Must be called from within a tokio runtime.
    pub fn spawn(config: ServerConfig, backend: Backend) -> Self {
        let default_branch = backend.default_branch(Some(&config));
        Self::launch(Ok(config), backend, default_branch)
    }

    /// Spawns a server from raw configuration sources.
    ///
    /// Invalid sources surface through [`wait_for_start`](Self::wait_for_start).
    pub fn spawn_from_sources(sources: &ConfigSources, backend: Backend) -> Self {
        let config = sources.resolve();
        let default_branch = backend.default_branch(config.as_ref().ok());
        Self::launch(config, backend, default_branch)
    }

    fn launch(
        config: Result<ServerConfig, ConfigErrors>,
        backend: Backend,
        default_branch: Arc<DefaultBranch>,
    ) -> Self {
        let controller = Arc::new(ServerController::new());
        let task = tokio::spawn(drive(
            config,
            Arc::clone(&controller),
            backend,
            Arc::clone(&default_branch),
        ));
        Self {
            controller,
            default_branch,
            task,
        }
    }

    /// Waits for the start outcome.
    pub async fn wait_for_start(&self) -> Result<SocketAddr, StartError> {
        self.controller.wait_for_start().await
    }

    /// Requests a graceful stop. Idempotent.
    pub fn stop(&self) {
        self.controller.request_stop();
    }

    /// Waits until the listener and every connection are gone.
    pub async fn wait_for_close(&self) {
        self.controller.wait_for_close().await;
    }

    /// Returns the lifecycle controller of this run.
    pub fn controller(&self) -> &Arc<ServerController> {
        &self.controller
    }

    /// Returns the server-wide default branch.
    pub fn default_branch(&self) -> &Arc<DefaultBranch> {
        &self.default_branch
    }

    /// Waits for the server task and returns its result.
    pub async fn join(self) -> ServerResult<()> {
        self.task.await?
    }
}
