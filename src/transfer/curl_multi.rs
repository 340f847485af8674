//! libcurl multi-socket transfer engine
//!
//! Sockets are opened through the easy handler's `open_socket` hook so each
//! native socket can be attributed to the session that owns it; the curl
//! crate's socket callback does not expose the easy handle. Connections are
//! never reused or multiplexed, so a socket serves one transfer from open
//! until curl reports its removal.

use crate::config::TransferConfig;
use crate::error::{MultiplexError, Result, TransferError};
use crate::transfer::{Completion, EngineNotice, TransferEngine, TransferRequest};
use crate::types::{DriveAction, Interest, SessionId, SocketEvent, SocketWants};
use bytes::Bytes;
use curl::easy::{Easy2, Handler, WriteError};
use curl::multi::{Easy2Handle, Events, Multi, Socket, SocketEvents};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::raw::c_int;
use std::sync::Arc;

type NoticeQueue = Arc<Mutex<Vec<EngineNotice>>>;
type SharedOwners = Arc<Mutex<SocketOwners>>;

/// Which session each live socket belongs to
#[derive(Debug, Default)]
struct SocketOwners {
    owners: HashMap<Socket, SessionId>,
}

impl SocketOwners {
    /// `socket` was just created for `session`; replaces any stale entry
    fn opened(&mut self, socket: Socket, session: SessionId) {
        self.owners.insert(socket, session);
    }

    /// Owner for a socket-state callback. A removal ends the socket's life,
    /// so its descriptor number no longer resolves once curl reuses it.
    fn resolve(&mut self, socket: Socket, wants: SocketWants) -> Option<SessionId> {
        match wants {
            SocketWants::Remove => self.owners.remove(&socket),
            SocketWants::Watch(_) => self.owners.get(&socket).copied(),
        }
    }

    /// Drop every socket of a detached session
    fn forget(&mut self, session: SessionId) {
        self.owners.retain(|_, owner| *owner != session);
    }
}

/// Easy handler for one session
struct Collector {
    session: SessionId,
    notices: NoticeQueue,
    owners: SharedOwners,
}

impl Handler for Collector {
    fn write(&mut self, data: &[u8]) -> std::result::Result<usize, WriteError> {
        tracing::trace!(session = %self.session, bytes = data.len(), "body chunk");
        self.notices.lock().push(EngineNotice::Data {
            session: self.session,
            chunk: Bytes::copy_from_slice(data),
        });
        Ok(data.len())
    }

    fn open_socket(&mut self, family: c_int, socktype: c_int, protocol: c_int) -> Option<Socket> {
        let socket = socket2::Socket::new(
            socket2::Domain::from(family),
            socket2::Type::from(socktype),
            Some(socket2::Protocol::from(protocol)),
        )
        .map_err(|e| tracing::warn!(session = %self.session, "Failed to open socket: {}", e))
        .ok()?;

        let fd = into_native(socket);
        tracing::debug!(session = %self.session, socket = fd, "opened socket");
        self.owners.lock().opened(fd, self.session);
        Some(fd)
    }
}

#[cfg(unix)]
fn into_native(socket: socket2::Socket) -> Socket {
    use std::os::fd::IntoRawFd;
    socket.into_raw_fd()
}

#[cfg(windows)]
fn into_native(socket: socket2::Socket) -> Socket {
    use std::os::windows::io::IntoRawSocket;
    socket.into_raw_socket()
}

/// Transfer engine backed by a libcurl multi handle
pub struct CurlEngine {
    multi: Multi,
    handles: HashMap<SessionId, Easy2Handle<Collector>>,
    /// Private-slot token of each attached handle
    tokens: HashMap<usize, SessionId>,
    next_token: usize,
    notices: NoticeQueue,
    owners: SharedOwners,
    config: TransferConfig,
}

impl CurlEngine {
    /// Create the multi handle and register its socket and timer callbacks
    pub fn new(config: TransferConfig) -> Result<Self> {
        let notices: NoticeQueue = Arc::new(Mutex::new(Vec::new()));
        let owners: SharedOwners = Arc::new(Mutex::new(SocketOwners::default()));
        let mut multi = Multi::new();
        multi
            .pipelining(false, false)
            .map_err(|e| MultiplexError::EngineInit(e.to_string()))?;

        let socket_notices = Arc::clone(&notices);
        let socket_owners = Arc::clone(&owners);
        multi
            .socket_function(move |socket: Socket, events: SocketEvents, _token: usize| {
                let wants = if events.remove() {
                    SocketWants::Remove
                } else {
                    SocketWants::Watch(Interest::new(events.input(), events.output()))
                };
                let session = socket_owners.lock().resolve(socket, wants);
                socket_notices.lock().push(EngineNotice::SocketState {
                    session,
                    socket,
                    wants,
                });
            })
            .map_err(|e| MultiplexError::EngineInit(e.to_string()))?;

        let timer_notices = Arc::clone(&notices);
        multi
            .timer_function(move |delay| {
                timer_notices
                    .lock()
                    .push(EngineNotice::TimerRequest { delay });
                true
            })
            .map_err(|e| MultiplexError::EngineInit(e.to_string()))?;

        Ok(Self {
            multi,
            handles: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 0,
            notices,
            owners,
            config,
        })
    }

    fn configure(&self, easy: &mut Easy2<Collector>, url: &str) -> std::result::Result<(), curl::Error> {
        let config = &self.config;
        easy.url(url)?;
        easy.useragent(&config.user_agent)?;
        easy.progress(false)?;
        easy.signal(false)?;
        if let Some(timeout) = config.connect_timeout() {
            easy.connect_timeout(timeout)?;
        }
        if config.low_speed_limit > 0 {
            easy.low_speed_limit(config.low_speed_limit)?;
            easy.low_speed_time(config.low_speed_time())?;
        }
        easy.follow_location(config.follow_redirects)?;
        if config.follow_redirects {
            easy.max_redirections(config.max_redirects)?;
        }
        easy.forbid_reuse(true)?;
        easy.verbose(config.verbose)?;
        Ok(())
    }
}

impl TransferEngine for CurlEngine {
    fn add(&mut self, request: &TransferRequest, session: SessionId) -> Result<()> {
        let mut easy = Easy2::new(Collector {
            session,
            notices: Arc::clone(&self.notices),
            owners: Arc::clone(&self.owners),
        });
        self.configure(&mut easy, &request.url)
            .map_err(|e| MultiplexError::transfer_setup(&request.url, e.to_string()))?;

        let mut handle = self
            .multi
            .add2(easy)
            .map_err(|e| MultiplexError::transfer_setup(&request.url, e.to_string()))?;
        let token = self.next_token;
        if let Err(e) = handle.set_token(token) {
            let _ = self.multi.remove2(handle);
            return Err(MultiplexError::transfer_setup(&request.url, e.to_string()));
        }
        self.next_token = self.next_token.wrapping_add(1);

        self.tokens.insert(token, session);
        self.handles.insert(session, handle);
        Ok(())
    }

    fn drive(&mut self, action: DriveAction) -> Result<usize> {
        let running = match action {
            DriveAction::Timeout => self.multi.timeout(),
            DriveAction::Socket { socket, event } => {
                let mut events = Events::new();
                match event {
                    SocketEvent::Readable => events.input(true),
                    SocketEvent::Writable => events.output(true),
                    SocketEvent::Error => events.error(true),
                };
                self.multi.action(socket, &events)
            }
        };
        running
            .map(|n| n as usize)
            .map_err(|e| MultiplexError::EngineDrive(e.to_string()))
    }

    fn take_notices(&mut self) -> Vec<EngineNotice> {
        std::mem::take(&mut *self.notices.lock())
    }

    fn poll_completed(&mut self) -> Vec<Completion> {
        let handles = &self.handles;
        let tokens = &self.tokens;
        let mut done = Vec::new();
        self.multi.messages(|message| {
            let Ok(token) = message.token() else {
                return;
            };
            let Some((&session, handle)) = tokens
                .get(&token)
                .and_then(|session| handles.get_key_value(session))
            else {
                tracing::warn!(token, "completion for unknown transfer");
                return;
            };
            if let Some(result) = message.result_for2(handle) {
                done.push(Completion {
                    session,
                    outcome: result.map_err(TransferError::from),
                });
            }
        });
        done
    }

    fn remove(&mut self, session: SessionId) {
        self.owners.lock().forget(session);
        self.tokens.retain(|_, owner| *owner != session);
        if let Some(handle) = self.handles.remove(&session) {
            if let Err(e) = self.multi.remove2(handle) {
                tracing::warn!(%session, "Failed to detach transfer: {}", e);
            }
        }
    }
}

impl Drop for CurlEngine {
    fn drop(&mut self) {
        for (_, handle) in self.handles.drain() {
            let _ = self.multi.remove2(handle);
        }
    }
}
