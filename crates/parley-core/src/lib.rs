//! parley-core: Shared protocol library for the parley message relay.
//!
//! Provides the JSON wire envelope, validated client identifiers,
//! keepalive/framing constants, and the common error type.

pub mod client_id;
pub mod envelope;
pub mod error;
pub mod protocol;

// Re-export commonly used items at crate root.
pub use client_id::ClientId;
pub use envelope::Envelope;
pub use error::{ParleyError, ParleyResult};
