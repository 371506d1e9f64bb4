use std::future::Future;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::connection::Connection;
use crate::handler::{ClientHandle, RequestHandler};
use crate::pool::{PoolError, WorkerPool};
use crate::session::{SessionError, SessionManager};
use crate::Error;

pub const DEFAULT_PORT: &str = "31337";
pub const DEFAULT_THREADS: usize = 4;
pub const DEFAULT_BACKLOG: u32 = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_BUCKET_COUNT: usize = 500;
pub const DEFAULT_SESSION_START: u32 = 1000;

#[derive(Debug, ThisError)]
pub enum ServerError {
    #[error("server error; invalid port {0:?}")]
    InvalidPort(String),
    #[error("server error; failed to resolve listening addresses: {0}")]
    Resolve(#[source] io::Error),
    #[error("server error; no local address could be bound on port {0}")]
    NoBindableAddress(u16),
    #[error("server error; failed to listen: {0}")]
    Listen(#[source] io::Error),
    #[error("server error; failed to accept a connection: {0}")]
    Accept(#[source] io::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("server error; teardown failed: {}", .0.join("; "))]
    Teardown(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: String,
    pub threads: usize,
    pub backlog: u32,
    /// How long a client may stay silent, or a send may block, before its connection is dropped.
    pub timeout: Duration,
    pub bucket_count: usize,
    pub session_start: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            threads: DEFAULT_THREADS,
            backlog: DEFAULT_BACKLOG,
            timeout: DEFAULT_TIMEOUT,
            bucket_count: DEFAULT_BUCKET_COUNT,
            session_start: DEFAULT_SESSION_START,
        }
    }
}

impl ServerConfig {
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_bucket_count(mut self, bucket_count: usize) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    pub fn with_session_start(mut self, session_start: u32) -> Self {
        self.session_start = session_start;
        self
    }
}

/// A bound, not yet listening, socket.
#[derive(Debug)]
pub struct ListenerConfig {
    socket: TcpSocket,
    pub address: SocketAddr,
    pub backlog: u32,
}

/// Resolves the wildcard IPv4 addresses for `port` and binds the first one that accepts a socket
/// with `SO_REUSEADDR` set.
pub async fn configure(port: &str) -> Result<ListenerConfig, ServerError> {
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|_| ServerError::InvalidPort(port.to_string()))?;

    let candidates = lookup_host(("0.0.0.0", port))
        .await
        .map_err(ServerError::Resolve)?
        .filter(SocketAddr::is_ipv4);

    for candidate in candidates {
        match bind(candidate) {
            Ok(socket) => {
                let address = socket.local_addr().unwrap_or(candidate);
                debug!(%address, "Bound listening socket");
                return Ok(ListenerConfig {
                    socket,
                    address,
                    backlog: DEFAULT_BACKLOG,
                });
            }
            Err(e) => warn!(%candidate, "Failed to bind: {}", e),
        }
    }

    Err(ServerError::NoBindableAddress(port))
}

fn bind(address: SocketAddr) -> io::Result<TcpSocket> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(address)?;
    Ok(socket)
}

/// Marks the socket as listening.
pub fn activate(listener: ListenerConfig) -> Result<TcpListener, ServerError> {
    listener
        .socket
        .listen(listener.backlog)
        .map_err(ServerError::Listen)
}

/// Everything a freshly accepted connection is handed to the pool with.
struct Acceptor<'a> {
    pool: &'a WorkerPool,
    manager: &'a Arc<SessionManager>,
    handler: &'a Arc<dyn RequestHandler>,
    timeout: Duration,
}

/// Accepts connections until `shutdown` is cancelled or accept fails hard. Each connection is
/// submitted to the pool as one job whose cleanup closes the socket.
///
/// Returns `Ok(())` when the loop ended because of a shutdown request.
async fn accept_loop(
    listener: &TcpListener,
    acceptor: &Acceptor<'_>,
    shutdown: &CancellationToken,
) -> Result<(), ServerError> {
    loop {
        let (stream, client_address) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, no longer accepting connections");
                return Ok(());
            }
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) if is_transient(&e) => {
                    warn!("Transient accept error: {}", e);
                    continue;
                }
                Err(e) => return Err(ServerError::Accept(e)),
            },
        };

        info!(%client_address, "Accepted connection");

        let stream = match into_blocking(stream, acceptor.timeout) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%client_address, "Abandoning connection: {}", e);
                continue;
            }
        };

        let connection = Connection::new(stream, client_address, acceptor.timeout, shutdown.clone());
        let client = ClientHandle::new(connection, acceptor.manager.clone());
        let handler = acceptor.handler.clone();

        acceptor.pool.submit(
            move |client: &mut ClientHandle| handle_connection(handler.as_ref(), client),
            ClientHandle::release,
            client,
        )?;
    }
}

fn into_blocking(stream: TcpStream, timeout: Duration) -> io::Result<std::net::TcpStream> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(stream)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

#[instrument(
    name = "connection",
    skip(handler, client),
    fields(connection_id, client_address)
)]
fn handle_connection(handler: &dyn RequestHandler, client: &mut ClientHandle) -> Result<(), Error> {
    tracing::Span::current()
        .record("connection_id", client.connection.id.to_string())
        .record("client_address", client.connection.client_address.to_string());

    debug!("Handling connection");
    let result = handler.handle(client);
    info!("Connection closed");

    result
}

/// A server whose listening socket is open and whose workers are running.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    pool: WorkerPool,
    manager: Arc<SessionManager>,
    handler: Arc<dyn RequestHandler>,
    timeout: Duration,
}

impl Server {
    /// Builds the shared tables, creates the default account, starts the workers and opens the
    /// listening socket, in that order. Any failure aborts startup.
    pub async fn bind<H: RequestHandler>(
        config: ServerConfig,
        handler: H,
    ) -> Result<Server, ServerError> {
        let manager = SessionManager::new(config.bucket_count, config.session_start)?;
        manager.bootstrap_default_account()?;

        let pool = WorkerPool::new(config.threads)?;

        let mut listener = configure(&config.port).await?;
        listener.backlog = config.backlog;
        let listener = activate(listener)?;
        let local_addr = listener.local_addr().map_err(ServerError::Listen)?;

        info!(%local_addr, threads = pool.thread_count(), "Server listening");

        Ok(Server {
            listener,
            local_addr,
            pool,
            manager: Arc::new(manager),
            handler: Arc::new(handler),
            timeout: config.timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves connections until `shutdown` is cancelled, then tears everything down.
    ///
    /// Teardown closes the listener, cancels in-flight connections, joins the workers and
    /// destroys the shared tables. Every step runs even if an earlier one failed.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let Server {
            listener,
            local_addr,
            pool,
            manager,
            handler,
            timeout,
        } = self;

        // Connections are cancelled on any exit from the accept loop, not only on a shutdown
        // request from the caller.
        let connections = shutdown.child_token();

        let acceptor = Acceptor {
            pool: &pool,
            manager: &manager,
            handler: &handler,
            timeout,
        };
        let accepted = accept_loop(&listener, &acceptor, &connections).await;

        drop(listener);
        info!(%local_addr, "Listener closed");
        connections.cancel();

        let failures = teardown(pool, manager).await;
        for failure in &failures {
            error!("Teardown step failed: {}", failure);
        }

        accepted?;

        if !failures.is_empty() {
            return Err(ServerError::Teardown(failures));
        }

        info!("Server stopped");
        Ok(())
    }
}

async fn teardown(pool: WorkerPool, manager: Arc<SessionManager>) -> Vec<String> {
    let mut failures = Vec::new();

    match tokio::task::spawn_blocking(move || pool.destroy()).await {
        Ok(Ok(report)) => debug!(discarded = report.discarded, "Workers joined"),
        Ok(Err(e)) => failures.push(e.to_string()),
        Err(e) => failures.push(format!("worker pool teardown task failed: {e}")),
    }

    match Arc::try_unwrap(manager) {
        Ok(manager) => {
            let summary = manager.destroy();
            debug!(
                accounts = summary.accounts,
                sessions = summary.sessions,
                data = summary.data,
                "Shared tables destroyed"
            );
        }
        Err(manager) => failures.push(format!(
            "shared tables are still referenced by {} connection(s)",
            Arc::strong_count(&manager) - 1
        )),
    }

    failures
}

/// Binds a server with `config` and serves `handler` until `shutdown` is cancelled.
pub async fn run<H: RequestHandler>(
    config: ServerConfig,
    handler: H,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    Server::bind(config, handler).await?.run(shutdown).await
}

/// Cancels `shutdown` once either future completes. A future that never completes leaves the
/// other one in charge.
pub async fn cancel_on_first<A, B>(shutdown: CancellationToken, first: A, second: B)
where
    A: Future<Output = ()>,
    B: Future<Output = ()>,
{
    tokio::select! {
        _ = first => {}
        _ = second => {}
    }

    shutdown.cancel();
}
