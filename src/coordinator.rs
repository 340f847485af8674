//! Multiplex Coordinator - main event loop
//!
//! The [`Coordinator`] owns the transfer engine, the reactor and the session
//! table. It feeds reactor events into the engine, turns the engine's
//! notices into reactor waits and timers, and delivers each finished
//! transfer to the [`CompletionSink`] exactly once.
//!
//! Everything runs on the calling thread. Engine notices are handled only
//! after the engine call that produced them has returned, and a zero-delay
//! timer request is posted to the reactor as a deferred wake-up, so the
//! engine is never re-entered from inside one of its own callbacks.

use crate::config::MultiplexConfig;
use crate::error::{MultiplexError, Result, TransferError};
use crate::reactor::{Reactor, ReactorEvent};
use crate::session::{Session, SessionTable};
use crate::transfer::{Completion, EngineNotice, TransferEngine, TransferRequest};
use crate::types::{
    DriveAction, Interest, NativeSocket, SessionId, SocketEvent, SocketWants, TimerId, WatchKind,
};
use bytes::Bytes;
use std::time::Duration;
use url::Url;

/// Receives the final result of every registered transfer, exactly once
pub trait CompletionSink {
    fn on_transfer_done(&mut self, url: &str, body: Bytes, error: Option<TransferError>);
}

impl<F> CompletionSink for F
where
    F: FnMut(&str, Bytes, Option<TransferError>),
{
    fn on_transfer_done(&mut self, url: &str, body: Bytes, error: Option<TransferError>) {
        self(url, body, error)
    }
}

/// Counters for one coordinator run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Transfers accepted by the engine
    pub registered: usize,
    /// Transfers delivered with a body
    pub succeeded: usize,
    /// Transfers delivered with an error
    pub failed: usize,
    /// Body bytes handed to the sink
    pub bytes_received: u64,
    /// Socket-action calls that returned an engine error
    pub drive_errors: usize,
}

/// Bridges a socket-action transfer engine and a readiness reactor
pub struct Coordinator<E, R, S> {
    engine: E,
    reactor: R,
    sink: S,
    sessions: SessionTable,
    /// Transfers the engine reported as running after its last drive
    active_count: usize,
    /// The single pending engine wake-up, if any
    retry_timer: Option<TimerId>,
    stats: RunStats,
}

impl<E, R, S> Coordinator<E, R, S>
where
    E: TransferEngine,
    R: Reactor,
    S: CompletionSink,
{
    pub fn new(engine: E, reactor: R, sink: S) -> Self {
        Self::with_config(engine, reactor, sink, &MultiplexConfig::default())
    }

    pub fn with_config(engine: E, reactor: R, sink: S, config: &MultiplexConfig) -> Self {
        Self {
            engine,
            reactor,
            sink,
            sessions: SessionTable::new(config.max_sessions),
            active_count: 0,
            retry_timer: None,
            stats: RunStats::default(),
        }
    }

    /// Create a session for `url` and add it to the transfer engine.
    ///
    /// A rejected transfer leaves no session behind.
    pub fn register(&mut self, url: impl Into<String>) -> Result<SessionId> {
        let url = url.into();
        Url::parse(&url).map_err(|e| MultiplexError::transfer_setup(&url, e.to_string()))?;

        let id = self
            .sessions
            .insert_with(|id| Session::new(id, url.clone()))?;

        if let Err(e) = self.engine.add(&TransferRequest::new(url.as_str()), id) {
            self.sessions.remove(id);
            tracing::warn!(%url, "Transfer rejected by engine: {}", e);
            self.process_notices()?;
            return Err(e);
        }

        self.stats.registered += 1;
        // Counted until the engine's next drive reports the real figure
        self.active_count += 1;
        tracing::debug!(session = %id, %url, "registered transfer");
        // Adding a transfer makes the engine ask for its first wake-up
        self.process_notices()?;
        Ok(id)
    }

    /// Run until no socket wait or wake-up remains.
    pub fn run(&mut self) -> Result<RunStats> {
        tracing::info!(sessions = self.sessions.len(), "multiplex loop started");

        while self.step()? {}

        self.reclaim_completed();
        if !self.sessions.is_empty() {
            tracing::warn!(
                remaining = self.sessions.len(),
                "loop went idle with undelivered transfers"
            );
        }

        tracing::info!(
            succeeded = self.stats.succeeded,
            failed = self.stats.failed,
            bytes = self.stats.bytes_received,
            "multiplex loop finished"
        );
        Ok(self.stats)
    }

    /// Handle one reactor event. Returns `Ok(false)` once the reactor is idle.
    pub fn step(&mut self) -> Result<bool> {
        let Some(event) = self.reactor.next_event()? else {
            return Ok(false);
        };

        let result = match event {
            ReactorEvent::Timer(timer) => self.on_timer_fire(timer),
            ReactorEvent::SocketReady {
                session,
                socket,
                kind,
                error,
            } => self.on_socket_ready(session, socket, kind, error),
        };

        if let Err(e) = &result {
            tracing::error!("Multiplex loop aborted: {}", e);
        }
        result.map(|()| true)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut R {
        &mut self.reactor
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Sessions not yet deleted, completed ones included
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn retry_timer(&self) -> Option<TimerId> {
        self.retry_timer
    }

    pub fn has_retry_timer(&self) -> bool {
        self.retry_timer.is_some()
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn on_timer_fire(&mut self, timer: TimerId) -> Result<()> {
        if self.retry_timer != Some(timer) {
            tracing::debug!(%timer, "ignoring superseded wake-up");
            return Ok(());
        }
        self.retry_timer = None;

        self.drive(DriveAction::Timeout)?;
        self.drain_completions()?;
        if self.active_count == 0 {
            self.cancel_retry_timer();
        }
        Ok(())
    }

    fn on_socket_ready(
        &mut self,
        id: SessionId,
        socket: NativeSocket,
        kind: WatchKind,
        error: Option<std::io::Error>,
    ) -> Result<()> {
        let Some(session) = self.sessions.get_mut(id) else {
            tracing::debug!(session = %id, socket, %kind, "readiness for deleted session");
            return Ok(());
        };

        match session.watch().native_handle() {
            Some(handle) if handle == socket => {}
            Some(handle) => {
                return Err(MultiplexError::SocketConsistency {
                    session: id,
                    expected: Some(handle),
                    actual: socket,
                })
            }
            None => {
                tracing::debug!(session = %id, socket, %kind, "readiness for closed watch");
                return Ok(());
            }
        }
        session.watch_mut().fired(kind);

        let event = match error {
            Some(e) => {
                tracing::debug!(session = %id, socket, "reactor reported socket error: {}", e);
                SocketEvent::Error
            }
            None => SocketEvent::from(kind),
        };

        self.drive(DriveAction::Socket { socket, event })?;
        self.drain_completions()?;
        if self.active_count == 0 {
            self.cancel_retry_timer();
        }

        let Some(session) = self.sessions.get_mut(id) else {
            return Ok(());
        };
        if session.is_completed() {
            self.delete_session(id);
            return self.process_notices();
        }

        // One-shot wait consumed: re-arm only the kind that fired, and only
        // while the engine still wants it on this socket
        if session.pending().contains(kind) && session.watch().native_handle() == Some(socket) {
            session.watch_mut().arm(&mut self.reactor, kind)?;
            tracing::trace!(session = %id, socket, %kind, "re-armed");
        }
        Ok(())
    }

    fn on_socket_state_change(
        &mut self,
        owner: Option<SessionId>,
        socket: NativeSocket,
        wants: SocketWants,
    ) -> Result<()> {
        let Some(id) = owner else {
            tracing::debug!(socket, ?wants, "socket without an owning transfer");
            return Ok(());
        };
        let Some(session) = self.sessions.get_mut(id) else {
            tracing::debug!(session = %id, socket, ?wants, "socket state for deleted session");
            return Ok(());
        };
        tracing::debug!(session = %id, socket, ?wants, "socket state change");

        match wants {
            SocketWants::Remove => {
                session.set_pending(Interest::NONE);
                if session.watch().native_handle() == Some(socket) {
                    session.watch_mut().close(&mut self.reactor);
                }
                if session.is_completed() {
                    self.delete_session(id);
                }
            }
            SocketWants::Watch(interest) => {
                session.set_pending(interest);
                let watch = session.watch_mut();
                watch.ensure_open(&mut self.reactor, socket, id)?;
                watch.sync(&mut self.reactor, interest)?;
            }
        }
        Ok(())
    }

    fn on_timer_request(&mut self, delay: Option<Duration>) {
        self.cancel_retry_timer();

        let Some(delay) = delay else {
            tracing::trace!("engine dropped its wake-up");
            return;
        };

        let timer = if delay.is_zero() {
            // Never drive the engine from inside its own callback
            self.reactor.defer()
        } else {
            self.reactor.schedule(delay)
        };
        tracing::trace!(%timer, ?delay, "engine wake-up scheduled");
        self.retry_timer = Some(timer);
    }

    fn cancel_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            self.reactor.cancel(timer);
        }
    }

    /// Socket-action call followed by handling of the notices it queued
    fn drive(&mut self, action: DriveAction) -> Result<()> {
        match self.engine.drive(action) {
            Ok(running) => self.active_count = running,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.stats.drive_errors += 1;
                tracing::warn!(?action, "Socket action failed: {}", e);
            }
        }
        self.process_notices()
    }

    fn process_notices(&mut self) -> Result<()> {
        loop {
            let notices = self.engine.take_notices();
            if notices.is_empty() {
                return Ok(());
            }
            for notice in notices {
                match notice {
                    EngineNotice::SocketState {
                        session,
                        socket,
                        wants,
                    } => self.on_socket_state_change(session, socket, wants)?,
                    EngineNotice::TimerRequest { delay } => self.on_timer_request(delay),
                    EngineNotice::Data { session, chunk } => match self.sessions.get_mut(session) {
                        Some(target) => target.append(&chunk),
                        None => tracing::debug!(%session, "data for deleted session"),
                    },
                }
            }
        }
    }

    fn drain_completions(&mut self) -> Result<()> {
        for Completion { session: id, outcome } in self.engine.poll_completed() {
            let Some(session) = self.sessions.get_mut(id) else {
                tracing::warn!(session = %id, "completion for deleted session");
                continue;
            };
            if !session.complete() {
                tracing::warn!(session = %id, "duplicate completion dropped");
                continue;
            }

            let body = session.take_body();
            match &outcome {
                Ok(()) => {
                    self.stats.succeeded += 1;
                    tracing::info!(url = session.url(), bytes = body.len(), "transfer finished");
                }
                Err(e) => {
                    self.stats.failed += 1;
                    tracing::info!(url = session.url(), "transfer failed: {}", e);
                }
            }
            self.stats.bytes_received += body.len() as u64;
            self.sink
                .on_transfer_done(session.url(), body, outcome.err());

            // With a wait still pending, deletion happens when it fires
            if !session.watch().has_pending_wait() {
                self.delete_session(id);
            }
        }
        self.process_notices()
    }

    /// Delete a completed session: close its watch and detach it from the engine
    fn delete_session(&mut self, id: SessionId) {
        match self.sessions.get(id) {
            Some(session) if session.is_completed() => {}
            Some(_) => {
                tracing::warn!(session = %id, "refusing to delete a running session");
                return;
            }
            None => return,
        }
        let Some(mut session) = self.sessions.remove(id) else {
            return;
        };
        session.watch_mut().close(&mut self.reactor);
        self.engine.remove(id);
        tracing::debug!(session = %id, url = session.url(), "session deleted");
    }

    fn reclaim_completed(&mut self) {
        let completed: Vec<SessionId> = self
            .sessions
            .ids()
            .filter(|id| self.sessions.get(*id).is_some_and(Session::is_completed))
            .collect();
        for id in completed {
            self.delete_session(id);
        }
    }
}
