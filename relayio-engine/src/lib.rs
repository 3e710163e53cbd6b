//! Session engine for the relayio stack.
//!
//! The engine owns everything below the messaging layer: the HTTP handshake,
//! the long-polling and WebSocket transports, the per-session write buffer,
//! the heartbeat and the transport upgrade dance. It is exposed as a
//! [`tower::Service`](https://docs.rs/tower/latest/tower/trait.Service.html)
//! so it can be mounted in any tower/hyper based stack.
//!
//! Applications rarely use this crate directly: the `relayio` crate layers
//! namespaces, rooms and acknowledgements on top of it through the
//! [`SessionHandler`](handler::SessionHandler) trait.

pub mod config;
pub mod errors;
pub mod handler;
pub mod layer;
pub mod packet;
pub mod service;
pub mod session;
pub mod sid;
pub mod str;

mod body;
mod engine;
mod futures;
mod payload;
mod peekable;

pub use packet::{OpenPacket, Packet};
pub use session::{DisconnectReason, Session, SessionReq};
pub use sid::Sid;
pub use str::Str;
