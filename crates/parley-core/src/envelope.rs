//! The JSON envelope exchanged between clients.
//!
//! Wire shape (same in both directions):
//!
//! ```json
//! { "channel_id": "optional", "sender_id": "alice", "receiver_id": "bob", "Message": "hi" }
//! ```

use crate::error::{ParleyError, ParleyResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Reserved for multi-channel use; carried through routing untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(rename = "Message")]
    pub message: String,
}

impl Envelope {
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: None,
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            message: message.into(),
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    /// Decode one frame payload. Missing fields and empty ids are rejected.
    pub fn decode(data: &[u8]) -> ParleyResult<Self> {
        let envelope: Envelope = serde_json::from_slice(data)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn encode(&self) -> ParleyResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self) -> ParleyResult<()> {
        if self.sender_id.is_empty() {
            return Err(ParleyError::InvalidMessage("sender_id is empty".into()));
        }
        if self.receiver_id.is_empty() {
            return Err(ParleyError::InvalidMessage("receiver_id is empty".into()));
        }
        Ok(())
    }
}
