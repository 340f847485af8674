//! Readiness reactor seam
//!
//! The reactor knows nothing about HTTP. It offers one-shot readiness waits
//! per socket and kind, cancellable wake-ups, and a blocking
//! [`Reactor::next_event`] that hands back one fired wait at a time. Events
//! are only ever produced by `next_event`, which the coordinator calls after
//! its previous handler has returned, so work posted with [`Reactor::defer`]
//! always runs on a fresh loop turn.

#[cfg(unix)]
pub mod event_loop;

use crate::error::Result;
use crate::types::{NativeSocket, SessionId, TimerId, WatchKind};
use std::time::Duration;

#[cfg(unix)]
pub use event_loop::TokioReactor;

/// One fired wait
#[derive(Debug)]
pub enum ReactorEvent {
    /// A one-shot socket wait fired
    SocketReady {
        session: SessionId,
        socket: NativeSocket,
        kind: WatchKind,
        /// Error condition reported for the socket instead of plain readiness
        error: Option<std::io::Error>,
    },
    /// A scheduled or deferred wake-up fired
    Timer(TimerId),
}

/// Readiness-based event loop driven by the coordinator
pub trait Reactor {
    /// Register `socket` for `session`. Returns the native handle the reactor
    /// now watches, which must equal `socket`.
    fn open(&mut self, socket: NativeSocket, session: SessionId) -> Result<NativeSocket>;

    /// Arm a one-shot wait. Arming a kind that is already armed is a no-op.
    fn watch(&mut self, socket: NativeSocket, kind: WatchKind) -> Result<()>;

    /// Disarm a pending wait, if any.
    fn unwatch(&mut self, socket: NativeSocket, kind: WatchKind);

    /// Drop the registration and every pending wait on it. No event for this
    /// registration is delivered afterwards.
    fn close(&mut self, socket: NativeSocket);

    /// One-shot wake-up after `delay`.
    fn schedule(&mut self, delay: Duration) -> TimerId;

    /// Wake-up on the next loop turn.
    fn defer(&mut self) -> TimerId;

    /// Cancel a wake-up. Returns false if it already fired or never existed.
    fn cancel(&mut self, timer: TimerId) -> bool;

    /// Block until a wait fires. `Ok(None)` once nothing is armed or scheduled.
    fn next_event(&mut self) -> Result<Option<ReactorEvent>>;
}

impl<R: Reactor + ?Sized> Reactor for Box<R> {
    fn open(&mut self, socket: NativeSocket, session: SessionId) -> Result<NativeSocket> {
        (**self).open(socket, session)
    }

    fn watch(&mut self, socket: NativeSocket, kind: WatchKind) -> Result<()> {
        (**self).watch(socket, kind)
    }

    fn unwatch(&mut self, socket: NativeSocket, kind: WatchKind) {
        (**self).unwatch(socket, kind)
    }

    fn close(&mut self, socket: NativeSocket) {
        (**self).close(socket)
    }

    fn schedule(&mut self, delay: Duration) -> TimerId {
        (**self).schedule(delay)
    }

    fn defer(&mut self) -> TimerId {
        (**self).defer()
    }

    fn cancel(&mut self, timer: TimerId) -> bool {
        (**self).cancel(timer)
    }

    fn next_event(&mut self) -> Result<Option<ReactorEvent>> {
        (**self).next_event()
    }
}
