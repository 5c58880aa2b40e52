//! Core server: accepts sockets, upgrades them, and runs each connection.
//!
//! Owns the registry, router and connection limiter for the lifetime of the
//! process and coordinates shutdown of every live connection.

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::limits::ConnectionLimiter;
use crate::relay::{ConnectionRegistry, Registration, Router};
use crate::transport::websocket;
use parley_core::{ParleyError, ParleyResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// The parley server instance.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    router: Arc<Router>,
    limiter: Arc<ConnectionLimiter>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(Router::new(registry.clone(), config.enqueue_timeout));
        let limiter = Arc::new(ConnectionLimiter::new(config.max_connections));
        Self {
            config,
            registry,
            router,
            limiter,
        }
    }

    pub async fn bind(&self) -> ParleyResult<TcpListener> {
        let addr = self.config.listen_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|e| ParleyError::Transport(format!("WS bind {addr} failed: {e}")))
    }

    /// Accept connections on `listener` until `shutdown` resolves, then close
    /// every live connection and wait (bounded) for them to finish.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> ParleyResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let server = Arc::new(self);
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            max_connections = server.config.max_connections,
            "parley-server ready"
        );

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, no longer accepting");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let srv = server.clone();
                        tasks.spawn(async move { srv.handle_socket(stream, remote).await });
                    }
                    Err(e) => {
                        error!(error = %e, "TCP accept failed");
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task failed");
                    }
                }
            }
        }
        drop(listener);

        if server.registry.is_empty().await {
            debug!("no clients online at shutdown");
        } else {
            let online = server.registry.ids().await;
            debug!(clients = ?online, "online at shutdown");
        }
        let closing = server.registry.shut_down().await;
        info!(connections = closing, "closing live connections");

        let settings = &server.config.connection;
        let drain = settings.close_grace + settings.write_timeout;
        let drained = tokio::time::timeout(drain, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "connections did not close in time, aborting");
            tasks.shutdown().await;
        }
        let leftover = server.registry.len().await;
        if leftover > 0 {
            warn!(leftover, "registry entries left after shutdown");
        }

        info!("parley-server stopped");
        Ok(())
    }

    /// Acceptor: upgrade, register, then run the connection until it closes.
    async fn handle_socket(&self, stream: TcpStream, remote: SocketAddr) {
        let guard = self.limiter.try_acquire();
        if guard.is_none() {
            warn!(
                remote = %remote,
                max_connections = self.limiter.max_connections(),
                "connection limit reached, refusing upgrade"
            );
        }

        let settings = &self.config.connection;
        let upgrade = websocket::accept(stream, remote, settings.max_frame_size, guard.is_some());
        let upgraded = match tokio::time::timeout(settings.write_timeout, upgrade).await {
            Ok(Ok(upgraded)) => upgraded,
            Ok(Err(e)) => {
                warn!(remote = %remote, error = %e, "WebSocket upgrade failed");
                return;
            }
            Err(_) => {
                warn!(remote = %remote, "WebSocket upgrade timed out");
                return;
            }
        };

        info!(
            remote = %upgraded.remote_addr,
            client_id = %upgraded.client_id,
            active = self.limiter.active(),
            "client connected"
        );

        let connection = Connection::new(upgraded.client_id, upgraded.ws_stream, settings.clone());
        match self.registry.add(connection.handle()).await {
            Registration::Registered => {}
            Registration::Replaced(previous) => {
                debug!(
                    client_id = %previous.id(),
                    serial = previous.serial(),
                    state = ?previous.state(),
                    "previous connection evicted"
                );
            }
            // Still run it: the write loop sends the close frame.
            Registration::Inactive => {
                debug!(remote = %remote, "connection closed before registration");
            }
        }
        let reason = connection
            .run(self.registry.clone(), self.router.clone())
            .await;
        debug!(remote = %remote, reason = %reason, "connection task finished");
        drop(guard);
    }
}
