//! Transfer engine seam
//!
//! The transfer engine owns HTTP/TLS protocol state and is driven through a
//! socket-action call. Whatever the engine wants to tell the coordinator
//! while it runs (socket interest changes, timer requests, body bytes) is
//! queued as an [`EngineNotice`] and handed over only after the engine call
//! has returned, so no notice handler can re-enter the engine.

#[cfg(feature = "curl")]
pub mod curl_multi;

use crate::error::{Result, TransferError};
use crate::types::{DriveAction, NativeSocket, SessionId, SocketWants};
use bytes::Bytes;
use std::time::Duration;

#[cfg(feature = "curl")]
pub use curl_multi::CurlEngine;

/// One transfer to hand to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
}

impl TransferRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// A callback the engine issued during its last call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotice {
    /// The engine's current want-set for a socket
    SocketState {
        /// Owning session, if the engine could attribute the socket
        session: Option<SessionId>,
        socket: NativeSocket,
        wants: SocketWants,
    },
    /// Wake the engine after `delay`; `None` asks to delete the pending wake-up
    TimerRequest { delay: Option<Duration> },
    /// Response bytes for a session, in arrival order
    Data { session: SessionId, chunk: Bytes },
}

/// A finished transfer reported by [`TransferEngine::poll_completed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub session: SessionId,
    pub outcome: std::result::Result<(), TransferError>,
}

/// Socket-action transfer engine driven by the coordinator
pub trait TransferEngine {
    /// Add a transfer; `session` goes into the engine's private slot and comes
    /// back on every notice and completion for this transfer.
    fn add(&mut self, request: &TransferRequest, session: SessionId) -> Result<()>;

    /// Socket-action call. Returns the number of transfers still running.
    fn drive(&mut self, action: DriveAction) -> Result<usize>;

    /// Drain the callbacks queued since the last call, oldest first.
    fn take_notices(&mut self) -> Vec<EngineNotice>;

    /// Drain finished transfers.
    fn poll_completed(&mut self) -> Vec<Completion>;

    /// Detach a transfer from the engine. Unknown sessions are ignored.
    fn remove(&mut self, session: SessionId);
}

impl<E: TransferEngine + ?Sized> TransferEngine for Box<E> {
    fn add(&mut self, request: &TransferRequest, session: SessionId) -> Result<()> {
        (**self).add(request, session)
    }

    fn drive(&mut self, action: DriveAction) -> Result<usize> {
        (**self).drive(action)
    }

    fn take_notices(&mut self) -> Vec<EngineNotice> {
        (**self).take_notices()
    }

    fn poll_completed(&mut self) -> Vec<Completion> {
        (**self).poll_completed()
    }

    fn remove(&mut self, session: SessionId) {
        (**self).remove(session)
    }
}
