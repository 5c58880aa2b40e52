//! Router: bridges one client's inbound envelope to another client's
//! outbound queue.
//!
//! Delivery is best effort and only to receivers that are online right now.
//! A full receiver queue is waited on for at most `enqueue_timeout`; after
//! that the message is dropped and the receiver is closed as a slow consumer,
//! so one stalled client can never hold a sender's read loop indefinitely.

use super::registry::ConnectionRegistry;
use crate::connection::lifecycle::CloseReason;
use parley_core::{Envelope, ParleyResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, info, warn};

/// What happened to a dispatched envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the receiver's outbound queue.
    Delivered,
    /// Receiver not registered (or already closing); message dropped.
    ReceiverOffline,
    /// Receiver queue stayed full; message dropped and receiver closed.
    ReceiverSaturated,
}

pub struct Router {
    registry: Arc<ConnectionRegistry>,
    enqueue_timeout: Duration,
}

impl Router {
    pub fn new(registry: Arc<ConnectionRegistry>, enqueue_timeout: Duration) -> Self {
        Self {
            registry,
            enqueue_timeout,
        }
    }

    /// Route one envelope to its receiver.
    ///
    /// Only an encoding failure is an error; every routing miss is reported
    /// through the returned [`Delivery`].
    pub async fn dispatch(&self, envelope: &Envelope) -> ParleyResult<Delivery> {
        let target = match self.registry.get(&envelope.receiver_id).await {
            Some(handle) if handle.is_active() => handle,
            _ => {
                info!(
                    sender = %envelope.sender_id,
                    receiver = %envelope.receiver_id,
                    "receiver offline, message dropped"
                );
                return Ok(Delivery::ReceiverOffline);
            }
        };

        let frame = envelope.encode()?;
        match target.outbound().send_timeout(frame, self.enqueue_timeout).await {
            Ok(()) => {
                debug!(
                    sender = %envelope.sender_id,
                    receiver = %envelope.receiver_id,
                    serial = target.serial(),
                    "message queued"
                );
                Ok(Delivery::Delivered)
            }
            Err(SendTimeoutError::Timeout(_)) => {
                target.close(CloseReason::SlowConsumer);
                warn!(
                    sender = %envelope.sender_id,
                    receiver = %envelope.receiver_id,
                    timeout_ms = self.enqueue_timeout.as_millis() as u64,
                    "receiver queue full, message dropped and receiver closed"
                );
                Ok(Delivery::ReceiverSaturated)
            }
            Err(SendTimeoutError::Closed(_)) => {
                info!(
                    sender = %envelope.sender_id,
                    receiver = %envelope.receiver_id,
                    "receiver went offline, message dropped"
                );
                Ok(Delivery::ReceiverOffline)
            }
        }
    }
}
