pub mod connection;
pub mod dispatcher;
pub mod presence;
pub mod registry;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use connection::Connection;
use dispatcher::Dispatcher;
use registry::{ConnId, Registry, SharedRegistry};

// ─── Server ─────────────────────────────────────────────────────────────────

/// The relay: one shared registry, one dispatcher task, one handler task per
/// connection.
pub struct Server {
    config: ServerConfig,
    registry: SharedRegistry,
    dispatcher: Dispatcher,
    conn_counter: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl Server {
    /// Build the server and spawn its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Registry::shared();
        let dispatcher = Dispatcher::spawn(registry.clone(), config.dispatch_queue);
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            registry,
            dispatcher,
            conn_counter: AtomicU64::new(0),
            connection_semaphore,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn listen_and_serve(self: Arc<Self>) -> Result<()> {
        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "chat relay listening");

        loop {
            match listener.accept().await {
                Ok((socket, peer)) => self.accept_tcp(socket, peer),
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    fn accept_tcp(self: &Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::warn!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
            }
        }
        self.spawn_connection(socket, peer.to_string());
    }

    /// Run the handler for one client stream on its own task.
    ///
    /// Any ordered byte stream works; the TCP accept loop uses this and so do
    /// the in-memory tests.
    pub fn spawn_connection<S>(self: &Arc<Self>, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let permit = match &self.connection_semaphore {
            Some(sem) => match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer, "connection rejected: limit reached");
                    return;
                }
            },
            None => None,
        };

        let id = ConnId(self.conn_counter.fetch_add(1, Ordering::Relaxed));
        tracing::info!(conn = %id, peer = %peer, "client connected");

        let conn = Connection::new(
            id,
            peer,
            self.registry.clone(),
            self.dispatcher.clone(),
            &self.config,
        );
        tokio::spawn(async move {
            conn.run(stream).await;
            drop(permit);
        });
    }
}
