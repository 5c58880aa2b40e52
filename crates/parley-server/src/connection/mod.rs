//! One client's live WebSocket: outbound queue, lifecycle and loop pair.
//!
//! A [`Connection`] owns the transport. The registry and the router only ever
//! see a [`ConnectionHandle`], which carries the queue sender and the
//! lifecycle but not the socket.
//!
//! `run` splits the transport and spawns two tasks:
//! - the read loop decodes envelopes and hands them to the router;
//! - the write loop is the only writer of the socket: queued frames, pings
//!   and the final close frame.
//!
//! The supervisor (the `run` future itself) waits for either loop to move the
//! lifecycle to `Closing`, deregisters, joins both loops and drops the
//! transport.

pub mod lifecycle;
mod read_loop;
mod write_loop;

use crate::relay::{ConnectionRegistry, Router};
use futures_util::StreamExt;
use lifecycle::{CloseReason, ConnectionState, Lifecycle};
use parley_core::protocol::{self, CLOSE_GRACE};
use parley_core::ClientId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Default capacity of each connection's outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// An encoded envelope waiting in an outbound queue.
pub type Frame = Vec<u8>;

/// The upgraded socket a connection owns.
pub type Transport = WebSocketStream<TcpStream>;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Keepalive, framing and queue settings applied to every connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// A peer silent (no pong) for this long is dropped.
    pub peer_timeout: Duration,
    pub ping_period: Duration,
    /// Deadline for each frame, ping or close write.
    pub write_timeout: Duration,
    /// How long to wait for the peer's close acknowledgment.
    pub close_grace: Duration,
    pub max_frame_size: usize,
    pub queue_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            peer_timeout: protocol::DEFAULT_PEER_TIMEOUT,
            ping_period: protocol::ping_period(protocol::DEFAULT_PEER_TIMEOUT),
            write_timeout: protocol::DEFAULT_WRITE_TIMEOUT,
            close_grace: CLOSE_GRACE,
            max_frame_size: protocol::DEFAULT_MAX_FRAME_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Identity of one particular connection: the claimed id plus a
/// process-unique serial, so a replacement under the same id is distinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub id: ClientId,
    pub serial: u64,
}

/// Transport-free view of a connection, stored in the registry.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    key: ConnectionKey,
    outbound: mpsc::Sender<Frame>,
    lifecycle: Arc<Lifecycle>,
}

impl ConnectionHandle {
    /// Create a handle in `Connecting` state together with the receiving end
    /// of its outbound queue.
    pub fn new(id: ClientId, queue_capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(queue_capacity);
        let handle = Self {
            key: ConnectionKey {
                id,
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            },
            outbound,
            lifecycle: Arc::new(Lifecycle::new()),
        };
        (handle, rx)
    }

    pub fn id(&self) -> &ClientId {
        &self.key.id
    }

    pub fn serial(&self) -> u64 {
        self.key.serial
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn outbound(&self) -> &mpsc::Sender<Frame> {
        &self.outbound
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// Ask the connection to shut down. Returns `false` if it was already
    /// closing.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.lifecycle.begin_close(reason)
    }

    pub(crate) fn activate(&self) -> bool {
        self.lifecycle.activate()
    }
}

/// A client's live connection.
pub struct Connection {
    handle: ConnectionHandle,
    transport: Transport,
    outbound: mpsc::Receiver<Frame>,
    settings: ConnectionSettings,
}

impl Connection {
    pub fn new(id: ClientId, transport: Transport, settings: ConnectionSettings) -> Self {
        let (handle, outbound) = ConnectionHandle::new(id, settings.queue_capacity);
        Self {
            handle,
            transport,
            outbound,
            settings,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Run both loops to completion and tear the connection down.
    ///
    /// Returns the reason the connection closed.
    pub async fn run(self, registry: Arc<ConnectionRegistry>, router: Arc<Router>) -> CloseReason {
        let Connection {
            handle,
            transport,
            outbound,
            settings,
        } = self;
        let key = handle.key().clone();
        let lifecycle = handle.lifecycle.clone();
        // Only the registry and in-flight dispatches may hold senders; once the
        // registry entry goes away the queue closes.
        drop(handle);

        let mut state_rx = lifecycle.subscribe();
        let (sink, stream) = transport.split();

        let reader = tokio::spawn(read_loop::run(
            read_loop::ReadContext {
                key: key.clone(),
                lifecycle: lifecycle.clone(),
                router,
                settings: settings.clone(),
            },
            stream,
        ));
        let writer = tokio::spawn(write_loop::run(
            write_loop::WriteContext {
                key: key.clone(),
                lifecycle: lifecycle.clone(),
                settings,
            },
            sink,
            outbound,
        ));
        // If this future is dropped (aborted at shutdown) the loops go with it.
        let _loops = AbortOnDrop(vec![reader.abort_handle(), writer.abort_handle()]);

        let reason = lifecycle::closing(&mut state_rx).await;
        if registry.remove(&key).await {
            debug!(client_id = %key.id, serial = key.serial, "deregistered");
        }

        match (reader.await, writer.await) {
            (Ok(stream), Ok(sink)) => match stream.reunite(sink) {
                Ok(transport) => drop(transport),
                Err(_) => warn!(client_id = %key.id, "transport halves did not match"),
            },
            (reader, writer) => {
                if let Err(e) = reader {
                    warn!(client_id = %key.id, error = %e, "read loop aborted");
                }
                if let Err(e) = writer {
                    warn!(client_id = %key.id, error = %e, "write loop aborted");
                }
            }
        }
        lifecycle.finish();

        if reason.is_abnormal() {
            warn!(client_id = %key.id, serial = key.serial, reason = %reason, "client disconnected");
        } else {
            info!(client_id = %key.id, serial = key.serial, reason = %reason, "client disconnected");
        }
        reason
    }
}

/// Aborts the wrapped tasks when dropped. Aborting a finished task is a no-op.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_abort_on_drop_cancels_tasks() {
        let task = tokio::spawn(std::future::pending::<()>());
        let guard = AbortOnDrop(vec![task.abort_handle()]);
        drop(guard);
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_abort_on_drop_ignores_finished_tasks() {
        let task = tokio::spawn(async { 7 });
        let abort = task.abort_handle();
        assert_eq!(task.await.unwrap(), 7);
        drop(AbortOnDrop(vec![abort]));
    }
}
