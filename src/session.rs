//! Sessions and their socket watches
//!
//! A [`Session`] is the coordinator-side state of one transfer. Its
//! [`SocketWatch`] mirrors the reactor registration for the transfer's
//! current socket and tracks which one-shot waits are armed.

use crate::error::{MultiplexError, Result};
use crate::reactor::Reactor;
use crate::types::{Interest, NativeSocket, SessionId, WatchKind};
use bytes::{Bytes, BytesMut};

/// Lifecycle of the reactor registration behind a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// The engine has not asked for a socket yet
    Unassigned,
    /// Registered with the reactor under this native handle
    Open(NativeSocket),
    /// The engine removed the socket; it may assign a new one later
    Removed(NativeSocket),
}

/// Per-session registration with the reactor
#[derive(Debug)]
pub struct SocketWatch {
    state: WatchState,
    armed: Interest,
}

impl Default for SocketWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketWatch {
    pub fn new() -> Self {
        Self {
            state: WatchState::Unassigned,
            armed: Interest::NONE,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, WatchState::Open(_))
    }

    /// Native handle of the open registration
    pub fn native_handle(&self) -> Option<NativeSocket> {
        match self.state {
            WatchState::Open(handle) => Some(handle),
            _ => None,
        }
    }

    /// Kinds with a one-shot wait currently pending in the reactor
    pub fn armed(&self) -> Interest {
        self.armed
    }

    pub fn has_pending_wait(&self) -> bool {
        !self.armed.is_empty()
    }

    /// Make sure the watch is open on `socket`, opening a registration for a
    /// new or re-created socket.
    ///
    /// The registered native handle must equal the engine's socket both for a
    /// fresh registration and for an already open one.
    pub fn ensure_open<R: Reactor + ?Sized>(
        &mut self,
        reactor: &mut R,
        socket: NativeSocket,
        session: SessionId,
    ) -> Result<()> {
        if let WatchState::Open(handle) = self.state {
            if handle == socket {
                return Ok(());
            }
            return Err(MultiplexError::SocketConsistency {
                session,
                expected: Some(handle),
                actual: socket,
            });
        }

        if let WatchState::Removed(previous) = self.state {
            tracing::debug!(%session, previous, socket, "socket re-created");
        }

        let handle = reactor.open(socket, session)?;
        if handle != socket {
            reactor.close(handle);
            return Err(MultiplexError::SocketConsistency {
                session,
                expected: Some(handle),
                actual: socket,
            });
        }

        self.state = WatchState::Open(handle);
        self.armed = Interest::NONE;
        Ok(())
    }

    /// Arm one kind; no-op if already armed
    pub fn arm<R: Reactor + ?Sized>(&mut self, reactor: &mut R, kind: WatchKind) -> Result<()> {
        let Some(handle) = self.native_handle() else {
            return Ok(());
        };
        if self.armed.contains(kind) {
            return Ok(());
        }
        reactor.watch(handle, kind)?;
        self.armed.insert(kind);
        Ok(())
    }

    /// Make the armed set equal `wants`: arm what is missing, disarm the rest
    pub fn sync<R: Reactor + ?Sized>(&mut self, reactor: &mut R, wants: Interest) -> Result<()> {
        let Some(handle) = self.native_handle() else {
            return Ok(());
        };
        for kind in WatchKind::ALL {
            if wants.contains(kind) {
                self.arm(reactor, kind)?;
            } else if self.armed.contains(kind) {
                reactor.unwatch(handle, kind);
                self.armed.remove(kind);
            }
        }
        Ok(())
    }

    /// Record that the reactor delivered the wait for `kind`
    pub fn fired(&mut self, kind: WatchKind) {
        self.armed.remove(kind);
    }

    /// Close the registration immediately; pending waits are dropped
    pub fn close<R: Reactor + ?Sized>(&mut self, reactor: &mut R) {
        if let WatchState::Open(handle) = self.state {
            reactor.close(handle);
            self.state = WatchState::Removed(handle);
        }
        self.armed = Interest::NONE;
    }
}

/// Engine-facing phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Added to the engine, transfer in progress
    Registered,
    /// Result delivered to the sink; terminal for engine interaction
    Completed,
}

/// Coordinator-side state of one transfer
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    url: String,
    body: BytesMut,
    watch: SocketWatch,
    pending: Interest,
    phase: SessionPhase,
}

impl Session {
    pub fn new(id: SessionId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            body: BytesMut::new(),
            watch: SocketWatch::new(),
            pending: Interest::NONE,
            phase: SessionPhase::Registered,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_completed(&self) -> bool {
        self.phase == SessionPhase::Completed
    }

    /// Mark completed. Returns false if it already was.
    pub fn complete(&mut self) -> bool {
        let first = self.phase != SessionPhase::Completed;
        self.phase = SessionPhase::Completed;
        first
    }

    /// Kinds the engine currently wants for this session's socket
    pub fn pending(&self) -> Interest {
        self.pending
    }

    pub fn set_pending(&mut self, wants: Interest) {
        self.pending = wants;
    }

    pub fn watch(&self) -> &SocketWatch {
        &self.watch
    }

    pub fn watch_mut(&mut self) -> &mut SocketWatch {
        &mut self.watch
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Append response bytes; ignored once completed
    pub fn append(&mut self, chunk: &[u8]) {
        if self.phase == SessionPhase::Registered {
            self.body.extend_from_slice(chunk);
        }
    }

    /// Hand the accumulated body over, leaving the buffer empty
    pub fn take_body(&mut self) -> Bytes {
        self.body.split().freeze()
    }
}

struct Slot {
    generation: u32,
    session: Option<Session>,
}

/// Session storage with generation-checked handles
///
/// Deleting a session bumps its slot's generation, so any [`SessionId`]
/// still held by the engine or the reactor stops resolving.
pub struct SessionTable {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    len: usize,
    capacity: usize,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            len: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocate a slot and build the session for its id
    pub fn insert_with(&mut self, build: impl FnOnce(SessionId) -> Session) -> Result<SessionId> {
        if self.len >= self.capacity {
            return Err(MultiplexError::ResourceLimit {
                resource: "sessions",
                limit: self.capacity,
            });
        }

        let index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    session: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        let id = SessionId::new(index, slot.generation);
        slot.session = Some(build(id));
        self.len += 1;
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.session.as_ref()
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.session.as_mut()
    }

    /// Delete a session; its id becomes stale
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let session = slot.session.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(id.index());
        self.len -= 1;
        Some(session)
    }

    pub fn ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.session
                .as_ref()
                .map(|_| SessionId::new(index as u32, slot.generation))
        })
    }
}
