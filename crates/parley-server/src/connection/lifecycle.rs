//! Connection state machine: `Connecting → Active → Closing → Closed`.
//!
//! The state lives in a `watch` channel so both loops and the supervisor can
//! wait for the transition out of `Active`, whoever triggers it.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::warn;

/// Why a connection left the `Active` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a close frame or hung up cleanly.
    PeerClosed,
    /// Malformed envelope, oversize frame or other protocol violation.
    Protocol(String),
    /// No pong arrived within the peer timeout.
    KeepaliveTimeout,
    /// Transport failure on the read side (reset, network error).
    Transport(String),
    /// A frame, ping or close write failed or missed its deadline.
    WriteFailed(String),
    /// Every sender of the outbound queue is gone.
    QueueClosed,
    /// A newer connection registered under the same client id.
    Replaced,
    /// The outbound queue stayed full past the enqueue timeout.
    SlowConsumer,
    ServerShutdown,
}

impl CloseReason {
    /// Close code sent to the peer in the close frame.
    pub fn close_code(&self) -> CloseCode {
        match self {
            CloseReason::PeerClosed | CloseReason::QueueClosed => CloseCode::Normal,
            CloseReason::ServerShutdown => CloseCode::Away,
            CloseReason::Protocol(_) => CloseCode::Protocol,
            CloseReason::Replaced | CloseReason::SlowConsumer => CloseCode::Policy,
            CloseReason::KeepaliveTimeout
            | CloseReason::Transport(_)
            | CloseReason::WriteFailed(_) => CloseCode::Error,
        }
    }

    /// Short text for the close frame (must stay under 123 bytes).
    pub fn label(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "closed by peer",
            CloseReason::Protocol(_) => "protocol error",
            CloseReason::KeepaliveTimeout => "keepalive timeout",
            CloseReason::Transport(_) => "transport error",
            CloseReason::WriteFailed(_) => "write failed",
            CloseReason::QueueClosed => "connection closed",
            CloseReason::Replaced => "replaced by a newer connection",
            CloseReason::SlowConsumer => "outbound queue full",
            CloseReason::ServerShutdown => "server shutdown",
        }
    }

    /// Abnormal closures are reported louder; they are never retried.
    pub fn is_abnormal(&self) -> bool {
        matches!(
            self,
            CloseReason::Protocol(_)
                | CloseReason::KeepaliveTimeout
                | CloseReason::Transport(_)
                | CloseReason::WriteFailed(_)
                | CloseReason::SlowConsumer
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Protocol(detail)
            | CloseReason::Transport(detail)
            | CloseReason::WriteFailed(detail) => write!(f, "{}: {detail}", self.label()),
            _ => f.write_str(self.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport upgraded, not yet registered.
    Connecting,
    /// Registered; both loops running.
    Active,
    /// Teardown initiated; loops are winding down.
    Closing(CloseReason),
    /// Transport closed and deregistered.
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }

    fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Active)
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            ConnectionState::Closing(reason) | ConnectionState::Closed(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<ConnectionState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self { state }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.state.borrow().is_active()
    }

    /// `Connecting → Active`. Fails if the connection already started closing.
    pub fn activate(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Move to `Closing(reason)`. Only the first caller wins; the reason of
    /// later callers is discarded.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_open() {
                *state = ConnectionState::Closing(reason);
                true
            } else {
                false
            }
        })
    }

    /// Final transition once the transport is gone.
    pub fn finish(&self) {
        self.state.send_modify(|state| {
            let reason = match state {
                ConnectionState::Closing(reason) | ConnectionState::Closed(reason) => {
                    reason.clone()
                }
                _ => CloseReason::Transport("finished without closing".into()),
            };
            *state = ConnectionState::Closed(reason);
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

/// Wait until the connection leaves `Connecting`/`Active` and return why.
///
/// The watch borrow is released before returning so callers may hold the
/// result across awaits.
pub async fn closing(state_rx: &mut watch::Receiver<ConnectionState>) -> CloseReason {
    match state_rx.wait_for(|state| !state.is_open()).await {
        Ok(state) => state
            .close_reason()
            .cloned()
            .unwrap_or(CloseReason::QueueClosed),
        Err(_) => CloseReason::Transport("lifecycle dropped".into()),
    }
}

/// Moves the connection to `Closing` if the owning task ends without doing
/// so itself (early return or panic).
pub(crate) struct CloseOnDrop {
    lifecycle: Arc<Lifecycle>,
    task: &'static str,
}

impl CloseOnDrop {
    pub(crate) fn new(lifecycle: Arc<Lifecycle>, task: &'static str) -> Self {
        Self { lifecycle, task }
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let reason = CloseReason::Transport(format!("{} task ended unexpectedly", self.task));
        if self.lifecycle.begin_close(reason) {
            warn!(task = self.task, "connection task exited without teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn happy_path_transitions() {
        let lc = Lifecycle::new();
        assert_eq!(lc.state(), ConnectionState::Connecting);
        assert!(lc.activate());
        assert!(lc.is_active());
        assert!(!lc.activate());
        assert!(lc.begin_close(CloseReason::PeerClosed));
        assert_eq!(lc.state(), ConnectionState::Closing(CloseReason::PeerClosed));
        lc.finish();
        assert_eq!(lc.state(), ConnectionState::Closed(CloseReason::PeerClosed));
    }

    #[test]
    fn first_close_wins() {
        let lc = Lifecycle::new();
        lc.activate();
        assert!(lc.begin_close(CloseReason::KeepaliveTimeout));
        assert!(!lc.begin_close(CloseReason::WriteFailed("broken pipe".into())));
        assert_eq!(
            lc.state().close_reason(),
            Some(&CloseReason::KeepaliveTimeout)
        );
    }

    #[test]
    fn cannot_activate_after_close() {
        let lc = Lifecycle::new();
        assert!(lc.begin_close(CloseReason::Replaced));
        assert!(!lc.activate());
    }

    #[test]
    fn close_codes() {
        assert_eq!(CloseReason::Replaced.close_code(), CloseCode::Policy);
        assert_eq!(CloseReason::ServerShutdown.close_code(), CloseCode::Away);
        assert_eq!(
            CloseReason::Protocol("bad json".into()).close_code(),
            CloseCode::Protocol
        );
        assert!(!CloseReason::PeerClosed.is_abnormal());
        assert!(CloseReason::KeepaliveTimeout.is_abnormal());
    }

    #[test]
    fn close_on_drop_fires_once() {
        let lc = Arc::new(Lifecycle::new());
        lc.activate();
        drop(CloseOnDrop::new(lc.clone(), "reader"));
        assert!(matches!(
            lc.state(),
            ConnectionState::Closing(CloseReason::Transport(_))
        ));

        let lc = Arc::new(Lifecycle::new());
        lc.activate();
        lc.begin_close(CloseReason::PeerClosed);
        drop(CloseOnDrop::new(lc.clone(), "writer"));
        assert_eq!(lc.state(), ConnectionState::Closing(CloseReason::PeerClosed));
    }

    #[tokio::test]
    async fn waiters_observe_closing() {
        let lc = Arc::new(Lifecycle::new());
        lc.activate();
        let mut rx = lc.subscribe();
        let waiter = tokio::spawn(async move { closing(&mut rx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        lc.begin_close(CloseReason::SlowConsumer);

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::SlowConsumer);
    }
}
