//! WebSocket server
//!
//! Owns the listening sockets, the subprotocol handler registry, and the
//! registry of live connections. Accepted connections are processed under a
//! shutdown barrier so that [`Server::stop`] can wait for every in-flight
//! accept loop and connection task before returning.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::channel::{MessageReader, MessageWriter};
use crate::connection::{Connection, HandlerMap};
use crate::error::Result;
use crate::Config;

/// An application handler bound to a subprotocol.
///
/// The handler is given the consumer end of the inbound queue and the
/// producer end of the outbound queue and implements the session logic.
/// Returning ends the session; an error terminates the connection.
pub type Handler =
    Arc<dyn Fn(MessageReader, MessageWriter) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Options for a listening socket
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Enable SO_REUSEADDR before binding (default: true)
    pub reuse_address: bool,
    /// Accept backlog
    pub backlog: u32,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            reuse_address: true,
            backlog: 1024,
        }
    }
}

/// What the server keeps per live connection: membership, not ownership.
pub(crate) struct ConnHandle {
    /// Cancelling this shuts down the connection's input side.
    pub(crate) shutdown_input: CancellationToken,
}

pub(crate) type ConnectionRegistry = Mutex<HashMap<u64, ConnHandle>>;

/// Registry membership guard held by a connection for its lifetime.
/// Dropping it removes the connection from the server's live set.
pub(crate) struct Registration {
    id: u64,
    registry: Arc<ConnectionRegistry>,
}

impl Registration {
    pub(crate) fn new(id: u64, registry: Arc<ConnectionRegistry>) -> Self {
        Self { id, registry }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
        debug!(connection = self.id, "connection finished");
    }
}

/// A WebSocket server.
///
/// Register handlers for the subprotocols you serve, then open one or more
/// listeners. `stop()` coordinates shutdown of everything the server
/// spawned.
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: Config,
    handlers: Arc<HandlerMap>,
    connections: Arc<ConnectionRegistry>,
    next_connection_id: AtomicU64,
    /// Shutdown barrier: every accept loop and connection task runs under it.
    tasks: TaskTracker,
    /// Abort tokens for the listeners' accept loops.
    listeners: Mutex<Vec<CancellationToken>>,
}

impl Server {
    /// Create a server with the given configuration
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                handlers: Arc::new(HandlerMap::default()),
                connections: Arc::new(ConnectionRegistry::default()),
                next_connection_id: AtomicU64::new(0),
                tasks: TaskTracker::new(),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Bind a handler to a subprotocol name.
    ///
    /// Registration is expected before serving begins; a handshake
    /// requesting a subprotocol with no registered handler fails the
    /// connection. The empty name handles requests that carry no
    /// `Sec-WebSocket-Protocol` header.
    pub fn register_handler<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(MessageReader, MessageWriter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |reader, writer| Box::pin(handler(reader, writer)));
        self.inner.handlers.write().insert(name.into(), handler);
    }

    /// Whether a handler is registered for the given subprotocol name
    pub fn is_handler_registered(&self, name: &str) -> bool {
        self.inner.handlers.read().contains_key(name)
    }

    /// Open a listener with default options (address reuse enabled).
    ///
    /// Returns the bound address, which is useful when binding port 0.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.listen_with(addr, ListenOptions::default()).await
    }

    /// Open a listener and start its accept loop under the shutdown barrier
    pub async fn listen_with(&self, addr: SocketAddr, options: ListenOptions) -> Result<SocketAddr> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if options.reuse_address {
            socket.set_reuseaddr(true)?;
        }
        socket.bind(addr)?;
        let listener = socket.listen(options.backlog)?;
        let local_addr = listener.local_addr()?;

        if self.inner.tasks.is_closed() {
            // The barrier refuses new work once draining has begun.
            debug!(%local_addr, "server is stopping; listener will not accept");
            return Ok(local_addr);
        }

        let abort = CancellationToken::new();
        self.inner.listeners.lock().push(abort.clone());
        self.inner
            .tasks
            .spawn(accept_loop(self.inner.clone(), listener, abort));
        info!(%local_addr, "listening for websocket connections");
        Ok(local_addr)
    }

    /// Coordinated stop.
    ///
    /// Aborts every listener's pending accept, shuts down the input half of
    /// every live connection (their decode loops observe end of stream and
    /// run the close handshake), then closes the shutdown barrier and waits
    /// for all in-flight work. Whatever is still registered afterwards is
    /// force-closed, ignoring individual errors.
    pub async fn stop(&self) {
        info!("stopping websocket server");

        for abort in self.inner.listeners.lock().drain(..) {
            abort.cancel();
        }

        self.inner.tasks.close();

        let inputs: Vec<CancellationToken> = self
            .inner
            .connections
            .lock()
            .values()
            .map(|conn| conn.shutdown_input.clone())
            .collect();
        for input in inputs {
            input.cancel();
        }

        self.inner.tasks.wait().await;

        let leftover: Vec<CancellationToken> = self
            .inner
            .connections
            .lock()
            .values()
            .map(|conn| conn.shutdown_input.clone())
            .collect();
        for input in leftover {
            input.cancel();
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/// Accept connections until the listener is aborted or fails.
///
/// A cancelled accept during `stop()` is expected and not an error; any
/// other accept failure is logged and ends this listener's loop.
async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener, abort: CancellationToken) {
    loop {
        tokio::select! {
            _ = abort.cancelled() => {
                debug!("accept aborted");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    if inner.tasks.is_closed() {
                        debug!(%peer_addr, "server stopping; dropping accepted connection");
                        break;
                    }
                    debug!(%peer_addr, "accepted connection");

                    let id = inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    let shutdown_input = CancellationToken::new();
                    inner.connections.lock().insert(
                        id,
                        ConnHandle {
                            shutdown_input: shutdown_input.clone(),
                        },
                    );
                    let connection = Connection::new(
                        stream,
                        inner.config.clone(),
                        inner.handlers.clone(),
                        shutdown_input,
                        Registration::new(id, inner.connections.clone()),
                    );
                    inner.tasks.spawn(connection.process());
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_registry() {
        let server = Server::default();
        assert!(!server.is_handler_registered("chat"));
        assert!(!server.is_handler_registered(""));

        server.register_handler("chat", |_reader, _writer| async { Ok(()) });
        assert!(server.is_handler_registered("chat"));
        assert!(!server.is_handler_registered("other"));

        // Empty name handles requests without a subprotocol header.
        server.register_handler("", |_reader, _writer| async { Ok(()) });
        assert!(server.is_handler_registered(""));
    }

    #[test]
    fn test_registration_guard_deregisters() {
        let registry = Arc::new(ConnectionRegistry::default());
        registry.lock().insert(
            7,
            ConnHandle {
                shutdown_input: CancellationToken::new(),
            },
        );

        let registration = Registration::new(7, registry.clone());
        assert_eq!(registry.lock().len(), 1);

        drop(registration);
        assert!(registry.lock().is_empty());
    }
}
