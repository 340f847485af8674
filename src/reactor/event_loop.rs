//! Tokio-backed reactor
//!
//! A current-thread tokio runtime provides the readiness and timer drivers.
//! Socket registrations (`AsyncFd`) and timers (`Sleep`) are owned by the
//! reactor itself rather than by spawned tasks, so closing a registration
//! deregisters it synchronously, before the engine closes or reuses the
//! descriptor.
//!
//! Tokio readiness is edge-triggered while the transfer engine expects
//! level-triggered waits (it may leave bytes unread). A cached readiness
//! edge is therefore confirmed with a zero-timeout `poll(2)` before it is
//! delivered; stale edges are cleared and waited on again.
//!
//! Each turn first delivers an expired timer, then sweeps the armed waits
//! with one `poll(2)` call in arming order. A delivered wait leaves the
//! queue and goes to the back when re-armed, so a socket that is always
//! ready cannot starve timers or other sockets. Only when nothing is ready
//! does the turn block inside the runtime.

use crate::error::{MultiplexError, Result};
use crate::reactor::{Reactor, ReactorEvent};
use crate::types::{Interest, NativeSocket, SessionId, TimerId, WatchKind};
use std::collections::{HashMap, VecDeque};
use std::future::{poll_fn, Future};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::runtime::Runtime;
use tokio::time::{Instant, Sleep};

/// Descriptor owned by the transfer engine; never closed here
struct EngineFd(RawFd);

impl AsRawFd for EngineFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct Registration {
    session: SessionId,
    fd: AsyncFd<EngineFd>,
    armed: Interest,
}

struct Timer {
    deadline: Instant,
    sleep: Pin<Box<Sleep>>,
}

#[derive(Debug, PartialEq, Eq)]
enum Level {
    Ready,
    NotReady,
    Invalid,
}

fn poll_events(kind: WatchKind) -> libc::c_short {
    match kind {
        WatchKind::Readable => libc::POLLIN,
        WatchKind::Writable => libc::POLLOUT,
    }
}

fn level_of(pfd: &libc::pollfd) -> Level {
    if pfd.revents & libc::POLLNVAL != 0 {
        Level::Invalid
    } else if pfd.revents != 0 {
        // POLLERR and POLLHUP count as ready; the engine reads the cause itself
        Level::Ready
    } else {
        Level::NotReady
    }
}

/// Zero-timeout `poll(2)` over `fds`; an interrupted call reports nothing ready
fn poll_now(fds: &mut [libc::pollfd]) -> io::Result<()> {
    if fds.is_empty() {
        return Ok(());
    }
    // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd for the
    // duration of the call and nfds is its length.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 0) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            fds.iter_mut().for_each(|pfd| pfd.revents = 0);
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

fn invalid_descriptor() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "descriptor is not open")
}

/// Zero-timeout readiness check on the descriptor itself
fn level(fd: RawFd, kind: WatchKind) -> io::Result<Level> {
    let mut pfd = [libc::pollfd {
        fd,
        events: poll_events(kind),
        revents: 0,
    }];
    poll_now(&mut pfd)?;
    Ok(level_of(&pfd[0]))
}

fn poll_socket(fd: &AsyncFd<EngineFd>, kind: WatchKind, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    loop {
        let mut guard = match kind {
            WatchKind::Readable => ready!(fd.poll_read_ready(cx))?,
            WatchKind::Writable => ready!(fd.poll_write_ready(cx))?,
        };
        match level(fd.get_ref().0, kind)? {
            Level::Ready => return Poll::Ready(Ok(())),
            Level::Invalid => return Poll::Ready(Err(invalid_descriptor())),
            Level::NotReady => guard.clear_ready(),
        }
    }
}

#[derive(Default)]
struct LoopState {
    sockets: HashMap<NativeSocket, Registration>,
    /// Armed one-shot waits, oldest arming first
    waits: VecDeque<(NativeSocket, WatchKind)>,
    timers: HashMap<TimerId, Timer>,
    deferred: VecDeque<TimerId>,
    next_timer: u64,
}

impl LoopState {
    fn next_timer_id(&mut self) -> TimerId {
        self.next_timer += 1;
        TimerId::new(self.next_timer)
    }

    fn is_idle(&self) -> bool {
        self.deferred.is_empty() && self.timers.is_empty() && self.waits.is_empty()
    }

    fn drop_waits(&mut self, socket: NativeSocket) {
        self.waits.retain(|(s, _)| *s != socket);
    }

    /// Take the wait at `index` out of the queue and build its event
    fn deliver(&mut self, index: usize, error: Option<io::Error>) -> Option<ReactorEvent> {
        let (socket, kind) = self.waits.remove(index)?;
        let reg = self.sockets.get_mut(&socket)?;
        reg.armed.remove(kind);
        Some(ReactorEvent::SocketReady {
            session: reg.session,
            socket,
            kind,
            error,
        })
    }

    /// Earliest timer whose deadline has passed
    fn expired_timer(&mut self) -> Option<TimerId> {
        let now = Instant::now();
        let id = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .min_by_key(|(id, timer)| (timer.deadline, **id))
            .map(|(id, _)| *id)?;
        self.timers.remove(&id);
        Some(id)
    }

    /// One `poll(2)` over every armed wait, first ready one in queue order
    fn sweep(&mut self) -> io::Result<Option<ReactorEvent>> {
        let mut fds: Vec<libc::pollfd> = self
            .waits
            .iter()
            .map(|&(socket, kind)| libc::pollfd {
                fd: socket,
                events: poll_events(kind),
                revents: 0,
            })
            .collect();
        poll_now(&mut fds)?;

        let found = fds.iter().enumerate().find_map(|(index, pfd)| match level_of(pfd) {
            Level::NotReady => None,
            Level::Ready => Some((index, None)),
            Level::Invalid => Some((index, Some(invalid_descriptor()))),
        });
        Ok(found.and_then(|(index, error)| self.deliver(index, error)))
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<ReactorEvent> {
        let fired = self
            .timers
            .iter_mut()
            .find_map(|(id, timer)| timer.sleep.as_mut().poll(cx).is_ready().then_some(*id));
        if let Some(id) = fired {
            self.timers.remove(&id);
            return Poll::Ready(ReactorEvent::Timer(id));
        }

        let mut found = None;
        for (index, &(socket, kind)) in self.waits.iter().enumerate() {
            let Some(reg) = self.sockets.get(&socket) else {
                continue;
            };
            if let Poll::Ready(result) = poll_socket(&reg.fd, kind, cx) {
                found = Some((index, result.err()));
                break;
            }
        }
        match found.and_then(|(index, error)| self.deliver(index, error)) {
            Some(event) => Poll::Ready(event),
            None => Poll::Pending,
        }
    }
}

/// Reactor running on a current-thread tokio runtime
pub struct TokioReactor {
    runtime: Runtime,
    state: LoopState,
}

impl TokioReactor {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        Ok(Self {
            runtime,
            state: LoopState::default(),
        })
    }

    /// Kinds currently armed on `socket`
    pub fn armed(&self, socket: NativeSocket) -> Interest {
        self.state
            .sockets
            .get(&socket)
            .map(|reg| reg.armed)
            .unwrap_or_default()
    }

    /// Number of pending wake-ups, deferred ones included
    pub fn pending_timers(&self) -> usize {
        self.state.timers.len() + self.state.deferred.len()
    }

    pub fn is_idle(&self) -> bool {
        self.state.is_idle()
    }
}

impl Reactor for TokioReactor {
    fn open(&mut self, socket: NativeSocket, session: SessionId) -> Result<NativeSocket> {
        if let Some(stale) = self.state.sockets.remove(&socket) {
            tracing::warn!(
                socket,
                %session,
                previous = %stale.session,
                "replacing registration left open for a reused descriptor"
            );
            self.state.drop_waits(socket);
        }

        let _enter = self.runtime.enter();
        let fd = AsyncFd::with_interest(
            EngineFd(socket),
            tokio::io::Interest::READABLE.add(tokio::io::Interest::WRITABLE),
        )?;
        let handle = fd.as_raw_fd();
        self.state.sockets.insert(
            socket,
            Registration {
                session,
                fd,
                armed: Interest::NONE,
            },
        );
        Ok(handle)
    }

    fn watch(&mut self, socket: NativeSocket, kind: WatchKind) -> Result<()> {
        let reg = self.state.sockets.get_mut(&socket).ok_or_else(|| {
            MultiplexError::Reactor(io::Error::new(
                io::ErrorKind::NotFound,
                format!("socket {} is not registered", socket),
            ))
        })?;
        if !reg.armed.contains(kind) {
            reg.armed.insert(kind);
            self.state.waits.push_back((socket, kind));
        }
        Ok(())
    }

    fn unwatch(&mut self, socket: NativeSocket, kind: WatchKind) {
        if let Some(reg) = self.state.sockets.get_mut(&socket) {
            reg.armed.remove(kind);
            self.state.waits.retain(|wait| *wait != (socket, kind));
        }
    }

    fn close(&mut self, socket: NativeSocket) {
        // Dropping the AsyncFd deregisters it from the runtime's driver
        self.state.sockets.remove(&socket);
        self.state.drop_waits(socket);
    }

    fn schedule(&mut self, delay: Duration) -> TimerId {
        let id = self.state.next_timer_id();
        let _enter = self.runtime.enter();
        let deadline = Instant::now() + delay;
        self.state.timers.insert(
            id,
            Timer {
                deadline,
                sleep: Box::pin(tokio::time::sleep_until(deadline)),
            },
        );
        id
    }

    fn defer(&mut self) -> TimerId {
        let id = self.state.next_timer_id();
        self.state.deferred.push_back(id);
        id
    }

    fn cancel(&mut self, timer: TimerId) -> bool {
        if self.state.timers.remove(&timer).is_some() {
            return true;
        }
        match self.state.deferred.iter().position(|id| *id == timer) {
            Some(pos) => {
                self.state.deferred.remove(pos);
                true
            }
            None => false,
        }
    }

    fn next_event(&mut self) -> Result<Option<ReactorEvent>> {
        if let Some(timer) = self.state.deferred.pop_front() {
            return Ok(Some(ReactorEvent::Timer(timer)));
        }
        if self.state.is_idle() {
            return Ok(None);
        }
        if let Some(timer) = self.state.expired_timer() {
            return Ok(Some(ReactorEvent::Timer(timer)));
        }
        if let Some(event) = self.state.sweep()? {
            return Ok(Some(event));
        }

        let state = &mut self.state;
        let event = self.runtime.block_on(poll_fn(|cx| state.poll_event(cx)));
        Ok(Some(event))
    }
}
