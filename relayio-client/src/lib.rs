//! Client-side connection manager for the relayio stack.
//!
//! The [`Manager`] mirrors the server's session engine: it owns one engine
//! session, answers the server's heartbeat and demultiplexes the messaging
//! layer to per-namespace [`Socket`]s. On top of that it adds what a client
//! needs in the field: reconnection with capped exponential backoff and
//! jitter, buffering of emits issued while disconnected (flushed in order
//! once the namespace is re-joined), and replay of pending acknowledgements
//! across reconnects when retries are configured.

pub mod backoff;
pub mod errors;
pub mod manager;
pub mod socket;
pub mod transport;

pub use backoff::Backoff;
pub use errors::ClientError;
pub use manager::{Manager, ManagerConfig, ManagerEvent};
pub use socket::Socket;
pub use transport::{Conn, Connector, PipeEnd, WsConnector};
