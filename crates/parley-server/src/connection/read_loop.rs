//! Inbound half: decode envelopes, enforce the read deadline, feed the router.

use super::lifecycle::{self, CloseOnDrop, CloseReason, Lifecycle};
use super::{ConnectionKey, ConnectionSettings, Transport};
use crate::relay::Router;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use parley_core::Envelope;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

pub(super) struct ReadContext {
    pub key: ConnectionKey,
    pub lifecycle: Arc<Lifecycle>,
    pub router: Arc<Router>,
    pub settings: ConnectionSettings,
}

/// Read until the connection closes, then hand the stream half back.
pub(super) async fn run(
    ctx: ReadContext,
    mut stream: SplitStream<Transport>,
) -> SplitStream<Transport> {
    let _guard = CloseOnDrop::new(ctx.lifecycle.clone(), "reader");
    let mut state_rx = ctx.lifecycle.subscribe();
    let mut deadline = Instant::now() + ctx.settings.peer_timeout;

    loop {
        tokio::select! {
            biased;

            reason = lifecycle::closing(&mut state_rx) => {
                debug!(client_id = %ctx.key.id, reason = %reason, "read loop stopping");
                // Give the peer a moment to acknowledge the close frame the
                // write loop is sending.
                if reason != CloseReason::PeerClosed {
                    await_close_ack(&mut stream, &ctx).await;
                }
                break;
            }

            next = tokio::time::timeout_at(deadline, stream.next()) => {
                let message = match next {
                    Err(_) => {
                        ctx.lifecycle.begin_close(CloseReason::KeepaliveTimeout);
                        continue;
                    }
                    Ok(None) => {
                        ctx.lifecycle.begin_close(CloseReason::PeerClosed);
                        continue;
                    }
                    Ok(Some(Err(e))) => {
                        ctx.lifecycle.begin_close(classify_error(&e));
                        continue;
                    }
                    Ok(Some(Ok(message))) => message,
                };

                match message {
                    Message::Text(text) => handle_payload(&ctx, text.as_bytes()).await,
                    Message::Binary(data) => handle_payload(&ctx, &data).await,
                    Message::Pong(_) => {
                        trace!(client_id = %ctx.key.id, "pong");
                        deadline = Instant::now() + ctx.settings.peer_timeout;
                    }
                    // Pings are answered by tungstenite itself.
                    Message::Ping(_) | Message::Frame(_) => {}
                    Message::Close(frame) => {
                        debug!(client_id = %ctx.key.id, frame = ?frame, "close frame received");
                        ctx.lifecycle.begin_close(CloseReason::PeerClosed);
                    }
                }
            }
        }
    }

    stream
}

async fn handle_payload(ctx: &ReadContext, data: &[u8]) {
    if data.len() > ctx.settings.max_frame_size {
        ctx.lifecycle.begin_close(CloseReason::Protocol(format!(
            "frame too large: {} bytes (max {})",
            data.len(),
            ctx.settings.max_frame_size
        )));
        return;
    }

    let envelope = match Envelope::decode(data) {
        Ok(envelope) => envelope,
        Err(e) => {
            ctx.lifecycle.begin_close(CloseReason::Protocol(e.to_string()));
            return;
        }
    };

    if let Err(e) = ctx.router.dispatch(&envelope).await {
        warn!(client_id = %ctx.key.id, error = %e, "dispatch failed");
    }
}

/// Drain inbound frames until the peer's close frame arrives, the stream
/// ends, or the close grace elapses.
async fn await_close_ack(stream: &mut SplitStream<Transport>, ctx: &ReadContext) {
    let drained = tokio::time::timeout(ctx.settings.close_grace, async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await;
    if drained.is_err() {
        debug!(client_id = %ctx.key.id, "peer did not acknowledge close in time");
    }
}

fn classify_error(e: &WsError) -> CloseReason {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => CloseReason::PeerClosed,
        WsError::Capacity(detail) => CloseReason::Protocol(detail.to_string()),
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            CloseReason::Transport("connection reset without closing handshake".into())
        }
        WsError::Protocol(detail) => CloseReason::Protocol(detail.to_string()),
        other => CloseReason::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::error::CapacityError;

    #[test]
    fn classify_graceful_and_abnormal() {
        assert_eq!(classify_error(&WsError::ConnectionClosed), CloseReason::PeerClosed);
        assert!(matches!(
            classify_error(&WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)),
            CloseReason::Transport(_)
        ));
        assert!(matches!(
            classify_error(&WsError::Capacity(CapacityError::MessageTooLong {
                size: 5000,
                max_size: 4096
            })),
            CloseReason::Protocol(_)
        ));
        assert!(matches!(
            classify_error(&WsError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset
            ))),
            CloseReason::Transport(_)
        ));
    }
}
