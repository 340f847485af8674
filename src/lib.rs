//! # multifetch
//!
//! Run many HTTP(S) transfers concurrently on one thread by bridging a
//! socket-action transfer engine (libcurl's multi-socket interface) with a
//! readiness-based reactor.
//!
//! The engine decides which sockets it cares about and when it wants a
//! wake-up; the reactor waits for readiness and time. The [`Coordinator`]
//! sits between them:
//!
//! - socket-state notices from the engine become one-shot reactor waits
//! - reactor readiness and timer firings become engine socket actions
//! - finished transfers are delivered to a [`CompletionSink`] exactly once
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(all(unix, feature = "curl"))]
//! # fn main() -> multifetch::Result<()> {
//! use multifetch::{Coordinator, CurlEngine, MultiplexConfig, TokioReactor};
//!
//! let config = MultiplexConfig::default();
//! let engine = CurlEngine::new(config.transfer.clone())?;
//! let reactor = TokioReactor::new()?;
//! let sink = |url: &str, body: bytes::Bytes, error: Option<multifetch::TransferError>| {
//!     match error {
//!         None => println!("{url}: {} bytes", body.len()),
//!         Some(e) => println!("{url}: {e}"),
//!     }
//! };
//!
//! let mut coordinator = Coordinator::with_config(engine, reactor, sink, &config);
//! coordinator.register("https://example.com/")?;
//! let stats = coordinator.run()?;
//! println!("{} succeeded, {} failed", stats.succeeded, stats.failed);
//! # Ok(())
//! # }
//! # #[cfg(not(all(unix, feature = "curl")))]
//! # fn main() {}
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod reactor;
pub mod session;
pub mod transfer;
pub mod types;

pub use config::{MultiplexConfig, TransferConfig};
pub use coordinator::{CompletionSink, Coordinator, RunStats};
pub use error::{MultiplexError, Result, TransferError, TransferErrorKind};
pub use reactor::{Reactor, ReactorEvent};
pub use session::{Session, SessionPhase, SessionTable, SocketWatch, WatchState};
pub use transfer::{Completion, EngineNotice, TransferEngine, TransferRequest};
pub use types::{
    DriveAction, Interest, NativeSocket, SessionId, SocketEvent, SocketWants, TimerId, WatchKind,
};

#[cfg(unix)]
pub use reactor::TokioReactor;

#[cfg(feature = "curl")]
pub use transfer::CurlEngine;
