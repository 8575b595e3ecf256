//! WebSocket transport: connection lifecycle, reconnection, liveness and
//! the outbound queue.

pub mod backoff;
pub mod events;
mod manager;

pub use backoff::ReconnectPolicy;
pub use events::{TransportEvent, TransportHandler, run_handler};
pub use manager::{Outbound, TransportManager, TransportStats};
