//! Adapters own the room membership state of one namespace and execute the
//! broadcasts over it. The default [`LocalAdapter`] keeps everything in
//! memory; alternative implementations can fan out across processes behind
//! the same trait.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock, Weak},
    time::Duration,
};

use itertools::Itertools;
use tracing::debug;

use relayio_engine::sid::Sid;

use crate::{
    ack::AckInnerStream,
    errors::{BroadcastError, SendError},
    ns::Namespace,
    operators::RoomParam,
    packet::Packet,
    socket::Socket,
};

/// A room identifier.
pub type Room = std::borrow::Cow<'static, str>;

/// Flags altering how a broadcast selects and reaches its targets.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum BroadcastFlags {
    /// Exclude the sending socket from the target set.
    Broadcast,
    /// Stay on this node when a multi-node adapter is in use. The in-memory
    /// adapter is single node, so this is a no-op here.
    Local,
    /// Drop the packet for targets whose write buffer is full instead of
    /// reporting an error.
    Volatile,
    /// Custom deadline for a broadcast with acks.
    Timeout(Duration),
}

/// Target selection of one broadcast.
#[derive(Clone, Debug, Default)]
pub struct BroadcastOptions {
    pub flags: HashSet<BroadcastFlags>,
    /// Rooms to broadcast to; empty means the whole namespace.
    pub rooms: Vec<Room>,
    /// Rooms whose members receive nothing from this broadcast.
    pub except: Vec<Room>,
    /// The sending socket, when the broadcast originates from one.
    pub sid: Option<Sid>,
}

impl BroadcastOptions {
    pub fn new(sid: Sid) -> Self {
        Self {
            sid: Some(sid),
            ..Default::default()
        }
    }
}

/// Membership index and broadcast executor of one namespace.
pub trait Adapter: Sized + Send + Sync + 'static {
    /// Creates the adapter for a namespace. The ref is weak because the
    /// namespace owns its adapter.
    fn new(ns: Weak<Namespace<Self>>) -> Self;

    /// Initializes the adapter.
    fn init(&self);
    /// Closes the adapter.
    fn close(&self);

    /// Number of server nodes sharing this namespace.
    fn server_count(&self) -> u16;

    /// Inserts the socket into each of the given rooms.
    fn add_all(&self, sid: Sid, rooms: impl RoomParam);
    /// Removes the socket from the given rooms.
    fn del(&self, sid: Sid, rooms: impl RoomParam);
    /// Removes the socket from every room it is in.
    fn del_all(&self, sid: Sid);

    /// Delivers the packet to every socket matching `opts`.
    fn broadcast(&self, packet: Packet<'static>, opts: BroadcastOptions)
        -> Result<(), BroadcastError>;

    /// As [`Adapter::broadcast`], but collects one acknowledgement per
    /// target. The stream completes once every target replied or the
    /// timeout expired, yielding partial results in the latter case.
    fn broadcast_with_ack(
        &self,
        packet: Packet<'static>,
        opts: BroadcastOptions,
        timeout: Option<Duration>,
    ) -> Result<AckInnerStream, BroadcastError>;

    /// The deduplicated members of the given rooms.
    fn sockets(&self, rooms: impl RoomParam) -> Vec<Sid>;

    /// The rooms the socket is in.
    fn socket_rooms(&self, sid: Sid) -> Vec<Room>;

    /// The sockets matching `opts`.
    fn fetch_sockets(&self, opts: BroadcastOptions) -> Vec<Arc<Socket<Self>>>;

    /// Adds every socket matching `opts` to the given rooms.
    fn add_sockets(&self, opts: BroadcastOptions, rooms: impl RoomParam);
    /// Removes every socket matching `opts` from the given rooms.
    fn del_sockets(&self, opts: BroadcastOptions, rooms: impl RoomParam);
    /// Disconnects every socket matching `opts`.
    fn disconnect_socket(&self, opts: BroadcastOptions) -> Result<(), BroadcastError>;

    /// Every room of the namespace.
    fn rooms(&self) -> Vec<Room>;
}

/// The two mutually consistent indexes of the in-memory adapter.
///
/// Invariant at every release of the lock: `sid ∈ rooms[r]` iff
/// `r ∈ sids[sid]`, and no room entry is empty.
#[derive(Debug, Default)]
struct AdapterState {
    rooms: HashMap<Room, HashSet<Sid>>,
    sids: HashMap<Sid, HashSet<Room>>,
}

/// The default in-memory, single node adapter.
#[derive(Debug)]
pub struct LocalAdapter {
    state: RwLock<AdapterState>,
    ns: Weak<Namespace<Self>>,
}

impl Adapter for LocalAdapter {
    fn new(ns: Weak<Namespace<Self>>) -> Self {
        Self {
            state: RwLock::new(AdapterState::default()),
            ns,
        }
    }

    fn init(&self) {}
    fn close(&self) {}

    fn server_count(&self) -> u16 {
        1
    }

    fn add_all(&self, sid: Sid, rooms: impl RoomParam) {
        let mut state = self.state.write().unwrap();
        for room in rooms.into_room_iter() {
            state.rooms.entry(room.clone()).or_default().insert(sid);
            state.sids.entry(sid).or_default().insert(room);
        }
    }

    fn del(&self, sid: Sid, rooms: impl RoomParam) {
        let mut state = self.state.write().unwrap();
        for room in rooms.into_room_iter() {
            if let Some(members) = state.rooms.get_mut(&room) {
                members.remove(&sid);
                if members.is_empty() {
                    state.rooms.remove(&room);
                }
            }
            if let Some(joined) = state.sids.get_mut(&sid) {
                joined.remove(&room);
                if joined.is_empty() {
                    state.sids.remove(&sid);
                }
            }
        }
    }

    fn del_all(&self, sid: Sid) {
        let mut state = self.state.write().unwrap();
        if let Some(joined) = state.sids.remove(&sid) {
            for room in joined {
                if let Some(members) = state.rooms.get_mut(&room) {
                    members.remove(&sid);
                    if members.is_empty() {
                        state.rooms.remove(&room);
                    }
                }
            }
        }
    }

    fn broadcast(
        &self,
        packet: Packet<'static>,
        opts: BroadcastOptions,
    ) -> Result<(), BroadcastError> {
        let volatile = opts.flags.contains(&BroadcastFlags::Volatile);
        // snapshot the target set before encoding: membership changes made
        // while the packet is being written do not affect this broadcast
        let sockets = self.apply_opts(opts);
        debug!("broadcasting packet to {} sockets", sockets.len());

        // encode once, share the frames with every target
        let (msg, bin) = packet.into_frames()?;

        let mut errors = Vec::new();
        for socket in sockets {
            match socket.send_raw(msg.clone(), &bin) {
                Ok(()) => (),
                Err(SendError::BufferFull) if volatile => {
                    debug!("[sid={}] volatile packet dropped", socket.id);
                }
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    fn broadcast_with_ack(
        &self,
        packet: Packet<'static>,
        opts: BroadcastOptions,
        timeout: Option<Duration>,
    ) -> Result<AckInnerStream, BroadcastError> {
        let timeout = timeout
            .or_else(|| {
                opts.flags.iter().find_map(|flag| match flag {
                    BroadcastFlags::Timeout(timeout) => Some(*timeout),
                    _ => None,
                })
            })
            .unwrap_or_else(|| {
                self.ns
                    .upgrade()
                    .map(|ns| ns.config.ack_timeout)
                    .unwrap_or(Duration::from_secs(5))
            });
        let sockets = self.apply_opts(opts);
        debug!("broadcasting packet with ack to {} sockets", sockets.len());

        let mut rxs = Vec::with_capacity(sockets.len());
        let mut errors = Vec::new();
        for socket in sockets {
            match socket.send_with_ack(packet.clone()) {
                Ok(rx) => rxs.push(rx),
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            Ok(AckInnerStream::broadcast(rxs, timeout))
        } else {
            Err(errors.into())
        }
    }

    fn sockets(&self, rooms: impl RoomParam) -> Vec<Sid> {
        let state = self.state.read().unwrap();
        rooms
            .into_room_iter()
            .filter_map(|room| state.rooms.get(&room))
            .flatten()
            .unique()
            .copied()
            .collect()
    }

    fn socket_rooms(&self, sid: Sid) -> Vec<Room> {
        let state = self.state.read().unwrap();
        state
            .sids
            .get(&sid)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn fetch_sockets(&self, opts: BroadcastOptions) -> Vec<Arc<Socket<Self>>> {
        self.apply_opts(opts)
    }

    fn add_sockets(&self, opts: BroadcastOptions, rooms: impl RoomParam) {
        let rooms: Vec<Room> = rooms.into_room_iter().collect();
        for socket in self.apply_opts(opts) {
            self.add_all(socket.id, rooms.clone());
        }
    }

    fn del_sockets(&self, opts: BroadcastOptions, rooms: impl RoomParam) {
        let rooms: Vec<Room> = rooms.into_room_iter().collect();
        for socket in self.apply_opts(opts) {
            self.del(socket.id, rooms.clone());
        }
    }

    fn disconnect_socket(&self, opts: BroadcastOptions) -> Result<(), BroadcastError> {
        let errors: Vec<_> = self
            .apply_opts(opts)
            .into_iter()
            .filter_map(|socket| socket.disconnect().err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    fn rooms(&self) -> Vec<Room> {
        self.state.read().unwrap().rooms.keys().cloned().collect()
    }
}

impl LocalAdapter {
    /// Resolves `opts` to its target sockets, deduplicated: a socket in two
    /// selected rooms gets the packet once.
    fn apply_opts(&self, opts: BroadcastOptions) -> Vec<Arc<Socket<Self>>> {
        let Some(ns) = self.ns.upgrade() else {
            return Vec::new();
        };
        let except = self.except_sids(&opts.except);
        let is_broadcast = opts.flags.contains(&BroadcastFlags::Broadcast);

        if !opts.rooms.is_empty() {
            let state = self.state.read().unwrap();
            opts.rooms
                .iter()
                .filter_map(|room| state.rooms.get(room))
                .flatten()
                .unique()
                .filter(|sid| {
                    !except.contains(*sid)
                        && (!is_broadcast || opts.sid.map_or(true, |sender| **sid != sender))
                })
                .filter_map(|sid| ns.get_socket(*sid))
                .collect()
        } else if is_broadcast {
            ns.get_sockets()
                .into_iter()
                .filter(|socket| {
                    !except.contains(&socket.id)
                        && opts.sid.map_or(true, |sender| socket.id != sender)
                })
                .collect()
        } else if let Some(sid) = opts.sid {
            ns.get_socket(sid).into_iter().collect()
        } else {
            ns.get_sockets()
                .into_iter()
                .filter(|socket| !except.contains(&socket.id))
                .collect()
        }
    }

    fn except_sids(&self, except: &[Room]) -> HashSet<Sid> {
        let state = self.state.read().unwrap();
        except
            .iter()
            .filter_map(|room| state.rooms.get(room))
            .flatten()
            .copied()
            .collect()
    }
}
