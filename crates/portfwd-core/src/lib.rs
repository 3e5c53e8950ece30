//! Single-hop TCP port forwarding engine
//!
//! A [`ForwardingSession`] listens on a source address and, for every inbound
//! connection, dials a fixed target and relays bytes in both directions.
//! Live connections are tracked in a [`ConnectionRegistry`] so the control
//! plane can report on them and tear them all down on stop.

mod error;
mod registry;
mod relay;
mod session;

pub use error::ForwardError;
pub use registry::{
    ByteCounters, ConnectionEntry, ConnectionId, ConnectionInfo, ConnectionRegistry,
};
pub use relay::{relay, RelayStats};
pub use session::{
    ForwardingSession, SessionConfig, SessionSnapshot, SessionState, DEFAULT_DIAL_TIMEOUT,
};
