//! Core types shared by the coordinator, the transfer engine and the reactor

use std::fmt;

/// Native socket handle as reported by the transfer engine
#[cfg(unix)]
pub type NativeSocket = std::os::fd::RawFd;

/// Native socket handle as reported by the transfer engine
#[cfg(windows)]
pub type NativeSocket = std::os::windows::io::RawSocket;

/// Generation-checked handle to a session slot
///
/// Callbacks carry this to name their transfer. A handle whose slot has
/// since been reused carries an older generation and resolves to nothing
/// instead of to the wrong session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl SessionId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}.{}", self.index, self.generation)
    }
}

/// One kind of one-shot readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Readable,
    Writable,
}

impl WatchKind {
    pub const ALL: [WatchKind; 2] = [WatchKind::Readable, WatchKind::Writable];
}

impl fmt::Display for WatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Readable => f.write_str("readable"),
            Self::Writable => f.write_str("writable"),
        }
    }
}

/// Set of readiness kinds wanted for (or armed on) a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Interest {
    readable: bool,
    writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    pub fn new(readable: bool, writable: bool) -> Self {
        Self { readable, writable }
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }

    pub fn contains(&self, kind: WatchKind) -> bool {
        match kind {
            WatchKind::Readable => self.readable,
            WatchKind::Writable => self.writable,
        }
    }

    pub fn insert(&mut self, kind: WatchKind) {
        match kind {
            WatchKind::Readable => self.readable = true,
            WatchKind::Writable => self.writable = true,
        }
    }

    pub fn remove(&mut self, kind: WatchKind) {
        match kind {
            WatchKind::Readable => self.readable = false,
            WatchKind::Writable => self.writable = false,
        }
    }

    /// Kinds in this set, readable first
    pub fn kinds(self) -> impl Iterator<Item = WatchKind> {
        WatchKind::ALL.into_iter().filter(move |kind| self.contains(*kind))
    }
}

impl From<WatchKind> for Interest {
    fn from(kind: WatchKind) -> Self {
        let mut interest = Interest::NONE;
        interest.insert(kind);
        interest
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.readable, self.writable) {
            (false, false) => f.write_str("none"),
            (true, false) => f.write_str("in"),
            (false, true) => f.write_str("out"),
            (true, true) => f.write_str("inout"),
        }
    }
}

/// The engine's full current declaration for one socket
///
/// Each declaration replaces the previous one; it is never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketWants {
    /// Wait for these kinds
    Watch(Interest),
    /// The socket is no longer the engine's concern
    Remove,
}

/// Event kind the engine is driven with for a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    Readable,
    Writable,
    /// The reactor reported an error condition on the socket
    Error,
}

impl From<WatchKind> for SocketEvent {
    fn from(kind: WatchKind) -> Self {
        match kind {
            WatchKind::Readable => Self::Readable,
            WatchKind::Writable => Self::Writable,
        }
    }
}

/// Argument of one socket-action call into the transfer engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveAction {
    /// Time-based bookkeeping with no socket
    Timeout,
    /// Activity on one socket
    Socket {
        socket: NativeSocket,
        event: SocketEvent,
    },
}

/// Handle to a cancellable scheduled wake-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}
