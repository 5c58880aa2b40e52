//! Online-client registry and envelope routing.

pub mod registry;
pub mod router;

pub use registry::{ConnectionRegistry, Registration};
pub use router::Router;
