//! Chainable operators selecting the targets of an emit and configuring the
//! packet before it leaves: rooms, exclusions, binary payloads, ack
//! timeouts.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use relayio_engine::sid::Sid;

use crate::{
    ack::AckStream,
    adapter::{Adapter, BroadcastFlags, BroadcastOptions, LocalAdapter, Room},
    errors::BroadcastError,
    ns::Namespace,
    packet::Packet,
    socket::Socket,
};

/// Anything that can name one or several rooms.
pub trait RoomParam: 'static {
    type IntoIter: Iterator<Item = Room>;

    fn into_room_iter(self) -> Self::IntoIter;
}

impl RoomParam for Room {
    type IntoIter = std::iter::Once<Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(self)
    }
}
impl RoomParam for String {
    type IntoIter = std::iter::Once<Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(Cow::Owned(self))
    }
}
impl RoomParam for &'static str {
    type IntoIter = std::iter::Once<Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(Cow::Borrowed(self))
    }
}
impl RoomParam for Vec<Room> {
    type IntoIter = std::vec::IntoIter<Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter()
    }
}
impl RoomParam for Vec<String> {
    type IntoIter = std::iter::Map<std::vec::IntoIter<String>, fn(String) -> Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(Cow::Owned)
    }
}
impl RoomParam for Vec<&'static str> {
    type IntoIter = std::iter::Map<std::vec::IntoIter<&'static str>, fn(&'static str) -> Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(Cow::Borrowed)
    }
}
impl<const N: usize> RoomParam for [&'static str; N] {
    type IntoIter = std::iter::Map<std::array::IntoIter<&'static str, N>, fn(&'static str) -> Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(Cow::Borrowed)
    }
}
impl<const N: usize> RoomParam for [String; N] {
    type IntoIter = std::iter::Map<std::array::IntoIter<String, N>, fn(String) -> Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(Cow::Owned)
    }
}
impl<const N: usize> RoomParam for [Room; N] {
    type IntoIter = std::array::IntoIter<Room, N>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter()
    }
}
impl RoomParam for Sid {
    type IntoIter = std::iter::Once<Room>;
    #[inline(always)]
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(Cow::Owned(self.to_string()))
    }
}

/// A broadcast in the making. Chain the selection operators, then finish
/// with [`emit`](Operators::emit), [`emit_with_ack`](Operators::emit_with_ack),
/// [`join`](Operators::join), [`leave`](Operators::leave),
/// [`disconnect`](Operators::disconnect) or [`sockets`](Operators::sockets).
pub struct Operators<A: Adapter = LocalAdapter> {
    ns: Arc<Namespace<A>>,
    opts: BroadcastOptions,
    binary: Vec<Bytes>,
    timeout: Option<Duration>,
}

impl<A: Adapter> Operators<A> {
    /// Namespace level operators: every socket of the namespace is selected
    /// until a room operator narrows it down.
    pub(crate) fn new(ns: Arc<Namespace<A>>) -> Self {
        Self {
            ns,
            opts: BroadcastOptions::default(),
            binary: Vec::new(),
            timeout: None,
        }
    }

    /// Socket level operators: the sending socket is remembered so it can
    /// be excluded by `to`/`broadcast`.
    pub(crate) fn from_sock(ns: Arc<Namespace<A>>, sid: Sid) -> Self {
        Self {
            ns,
            opts: BroadcastOptions::new(sid),
            binary: Vec::new(),
            timeout: None,
        }
    }

    /// Selects everyone in the given rooms, except the sending socket.
    pub fn to(mut self, rooms: impl RoomParam) -> Self {
        self.opts.rooms.extend(rooms.into_room_iter());
        self.opts.flags.insert(BroadcastFlags::Broadcast);
        self
    }

    /// Selects everyone in the given rooms, including the sending socket.
    pub fn within(mut self, rooms: impl RoomParam) -> Self {
        self.opts.rooms.extend(rooms.into_room_iter());
        self
    }

    /// Removes the members of the given rooms from the selection, whatever
    /// the room overlap. A socket id is a valid room name here, every
    /// socket being a member of the room named by its own id.
    pub fn except(mut self, rooms: impl RoomParam) -> Self {
        self.opts.except.extend(rooms.into_room_iter());
        self.opts.flags.insert(BroadcastFlags::Broadcast);
        self
    }

    /// Selects the whole namespace, except the sending socket.
    pub fn broadcast(mut self) -> Self {
        self.opts.flags.insert(BroadcastFlags::Broadcast);
        self
    }

    /// Stays on this node when a multi-node adapter is in use.
    pub fn local(mut self) -> Self {
        self.opts.flags.insert(BroadcastFlags::Local);
        self
    }

    /// Drops the packet for targets whose write buffer is full instead of
    /// failing the broadcast for them.
    pub fn volatile(mut self) -> Self {
        self.opts.flags.insert(BroadcastFlags::Volatile);
        self
    }

    /// Custom ack deadline for this emit, overriding the configured one.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches binary payloads to the event.
    pub fn bin(mut self, binary: impl IntoIterator<Item = impl Into<Bytes>>) -> Self {
        self.binary = binary.into_iter().map(Into::into).collect();
        self
    }

    /// Emits the event to every selected socket. Per-target failures are
    /// collected; they never abort the delivery to the other targets.
    pub fn emit<T: Serialize>(
        mut self,
        event: impl Into<Cow<'static, str>>,
        data: T,
    ) -> Result<(), BroadcastError> {
        let packet = self.make_packet(event, data)?;
        self.ns.adapter.broadcast(packet, self.opts)
    }

    /// Emits the event to every selected socket and returns the stream of
    /// their acknowledgements. The stream completes when every target
    /// replied or the deadline expired.
    pub fn emit_with_ack<T: Serialize, V>(
        mut self,
        event: impl Into<Cow<'static, str>>,
        data: T,
    ) -> Result<AckStream<V>, BroadcastError> {
        let packet = self.make_packet(event, data)?;
        let stream = self
            .ns
            .adapter
            .broadcast_with_ack(packet, self.opts, self.timeout)?;
        Ok(stream.into())
    }

    /// Makes every selected socket join the given rooms.
    pub fn join(self, rooms: impl RoomParam) {
        self.ns.adapter.add_sockets(self.opts, rooms)
    }

    /// Makes every selected socket leave the given rooms.
    pub fn leave(self, rooms: impl RoomParam) {
        self.ns.adapter.del_sockets(self.opts, rooms)
    }

    /// Returns every selected socket.
    pub fn sockets(self) -> Vec<Arc<Socket<A>>> {
        self.ns.adapter.fetch_sockets(self.opts)
    }

    /// Disconnects every selected socket from the namespace.
    pub fn disconnect(self) -> Result<(), BroadcastError> {
        self.ns.adapter.disconnect_socket(self.opts)
    }

    /// Every room of the namespace.
    pub fn rooms(self) -> Vec<Room> {
        self.ns.adapter.rooms()
    }

    fn make_packet<T: Serialize>(
        &mut self,
        event: impl Into<Cow<'static, str>>,
        data: T,
    ) -> Result<Packet<'static>, serde_json::Error> {
        let ns = self.ns.path.clone();
        let data: Value = serde_json::to_value(data)?;
        let packet = if self.binary.is_empty() {
            Packet::event(ns, event.into(), data)
        } else {
            let binary = std::mem::take(&mut self.binary);
            Packet::bin_event(ns, event.into(), data, binary)
        };
        Ok(packet)
    }
}
