//! Bidirectional streaming session against the Live API endpoint.

pub mod transport;
pub mod wire;

pub use transport::{ConnectionState, SessionTransport, TransportEvent};
