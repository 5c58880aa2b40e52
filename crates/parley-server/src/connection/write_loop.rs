//! Outbound half: the only writer of the socket.

use super::lifecycle::{self, CloseOnDrop, CloseReason, Lifecycle};
use super::{ConnectionKey, ConnectionSettings, Frame, Transport};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use parley_core::{ParleyError, ParleyResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

pub(super) struct WriteContext {
    pub key: ConnectionKey,
    pub lifecycle: Arc<Lifecycle>,
    pub settings: ConnectionSettings,
}

type Sink = SplitSink<Transport, Message>;

/// Drain the outbound queue and keep the peer alive until the connection
/// closes, then hand the sink half back.
pub(super) async fn run(
    ctx: WriteContext,
    mut sink: Sink,
    mut outbound: mpsc::Receiver<Frame>,
) -> Sink {
    let _guard = CloseOnDrop::new(ctx.lifecycle.clone(), "writer");
    let mut state_rx = ctx.lifecycle.subscribe();
    let period = ctx.settings.ping_period;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            reason = lifecycle::closing(&mut state_rx) => {
                if sends_close_frame(&reason) {
                    let frame = CloseFrame {
                        code: reason.close_code(),
                        reason: reason.label().into(),
                    };
                    if let Err(e) = write_with_deadline(
                        &mut sink,
                        Message::Close(Some(frame)),
                        ctx.settings.write_timeout,
                    )
                    .await
                    {
                        debug!(client_id = %ctx.key.id, error = %e, "close frame not sent");
                    }
                }
                break;
            }

            queued = outbound.recv() => match queued {
                Some(frame) => {
                    trace!(client_id = %ctx.key.id, bytes = frame.len(), "writing frame");
                    if let Err(e) = write_with_deadline(
                        &mut sink,
                        Message::Binary(frame),
                        ctx.settings.write_timeout,
                    )
                    .await
                    {
                        ctx.lifecycle.begin_close(CloseReason::WriteFailed(e.to_string()));
                    }
                }
                None => {
                    ctx.lifecycle.begin_close(CloseReason::QueueClosed);
                }
            },

            _ = ticker.tick() => {
                trace!(client_id = %ctx.key.id, "ping");
                if let Err(e) = write_with_deadline(
                    &mut sink,
                    Message::Ping(Vec::new()),
                    ctx.settings.write_timeout,
                )
                .await
                {
                    ctx.lifecycle.begin_close(CloseReason::WriteFailed(format!("ping: {e}")));
                }
            }
        }
    }

    sink
}

/// A broken transport gets no close frame; everything else is told why.
fn sends_close_frame(reason: &CloseReason) -> bool {
    !matches!(
        reason,
        CloseReason::WriteFailed(_) | CloseReason::Transport(_)
    )
}

async fn write_with_deadline(sink: &mut Sink, message: Message, deadline: Duration) -> ParleyResult<()> {
    match tokio::time::timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ParleyError::Transport(format!("WS send failed: {e}"))),
        Err(_) => Err(ParleyError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_transports_skip_close_frame() {
        assert!(!sends_close_frame(&CloseReason::WriteFailed("x".into())));
        assert!(!sends_close_frame(&CloseReason::Transport("reset".into())));
        assert!(sends_close_frame(&CloseReason::Replaced));
        assert!(sends_close_frame(&CloseReason::KeepaliveTimeout));
        assert!(sends_close_frame(&CloseReason::PeerClosed));
    }
}
