//! Multiplexed real-time messaging server, built as a tower layer on top of
//! the `relayio-engine` session engine.
//!
//! Clients hold one long lived session and exchange named events carrying
//! structured payloads. Sessions are organized in namespaces (logical
//! channels with their own socket set and auth), and rooms allow selective
//! broadcast within one namespace. Emits can carry binary payloads and be
//! acknowledged by the receiver, with an awaitable ack handle on the
//! sending side.
//!
//! ## Usage
//!
//! ```no_run
//! use relayio::RelayIo;
//! use serde_json::Value;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (svc, io) = RelayIo::builder()
//!         .ns("/", |socket| async move {
//!             println!("socket connected on / with id {}", socket.id);
//!
//!             socket.on("message", |socket, data: Value, _bin, _ack| async move {
//!                 socket.broadcast().emit("message", data).ok();
//!             });
//!
//!             socket.on("ping", |_socket, data: Value, _bin, ack| async move {
//!                 if let Some(ack) = ack {
//!                     ack.send(data).ok();
//!                 }
//!             });
//!
//!             socket.on_disconnect(|socket, reason| async move {
//!                 println!("socket {} disconnected: {}", socket.id, reason);
//!             });
//!         })
//!         .build_svc();
//!
//!     // mount `svc` in a hyper server, see the service module
//!     let _ = svc;
//!     let _ = io;
//! }
//! ```

pub mod ack;
pub mod adapter;
pub mod errors;
pub mod handshake;
pub mod layer;
pub mod operators;
pub mod packet;
pub mod service;
pub mod socket;

#[doc(hidden)]
pub mod client;

mod config;
mod io;
mod ns;

pub use client::NsMatcher;
pub use config::RelayConfig;
pub use errors::{AckError, AuthError, BroadcastError, SendError};
pub use handshake::Handshake;
pub use io::{RelayIo, RelayIoBuilder};
pub use ns::Namespace;
pub use operators::Operators;
pub use relayio_engine::service::TransportType;
pub use relayio_engine::sid::Sid;
pub use socket::{AckSender, DisconnectReason, Socket};
