//! Coordinator integration tests
//!
//! These run the coordinator against a scripted transfer engine and a
//! deterministic reactor, covering delivery, watch bookkeeping, timers and
//! session lifetime.


use multifetch::{
    DriveAction, Interest, MultiplexConfig, MultiplexError, ReactorEvent, SocketEvent, TimerId,
    TransferErrorKind, WatchKind, WatchState,
};
use std::time::Duration;
use test_helpers::{coordinator, FakeReactor, Op, Reaction, RecordingSink, ScriptedEngine};

const A: &str = "http://a.test/";
const B: &str = "http://b.test/";
const C: &str = "http://c.test/";

#[test]
fn test_every_session_delivered_once() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(A, vec![Reaction::timer_ms(0)])
        .on_add(B, vec![Reaction::timer_ms(0)])
        .on_add(C, vec![Reaction::timer_ms(0)])
        .on_timeout(vec![
            Reaction::watch(A, 5, Interest::WRITABLE),
            Reaction::watch(B, 6, Interest::WRITABLE),
            Reaction::failed(C, TransferErrorKind::DnsResolution, "Could not resolve host: c.test"),
            Reaction::timer_ms(100),
        ])
        .on_socket(5, vec![Reaction::watch(A, 5, Interest::READABLE)])
        .on_socket(6, vec![Reaction::watch(B, 6, Interest::READABLE)])
        .on_socket(
            5,
            vec![
                Reaction::Data(A, b"hello"),
                Reaction::done(A),
                Reaction::remove(A, 5),
            ],
        )
        .on_socket(
            6,
            vec![
                Reaction::Data(B, b"world!"),
                Reaction::done(B),
                Reaction::remove(B, 6),
            ],
        );

    let mut coordinator = coordinator(engine);
    coordinator
        .reactor_mut()
        .ready(5, WatchKind::Writable)
        .ready(6, WatchKind::Writable)
        .ready(5, WatchKind::Readable)
        .ready(6, WatchKind::Readable);

    for url in [A, B, C] {
        coordinator.register(url).unwrap();
    }
    let stats = coordinator.run().unwrap();

    let sink = coordinator.sink();
    assert_eq!(sink.deliveries.len(), 3);
    for url in [A, B, C] {
        assert_eq!(sink.count_for(url), 1, "{url} delivered once");
    }
    assert_eq!(sink.body_for(A).unwrap().as_ref(), b"hello");
    assert_eq!(sink.body_for(B).unwrap().as_ref(), b"world!");
    assert!(sink.error_for(A).is_none());
    assert!(sink.error_for(B).is_none());
    assert_eq!(
        sink.error_for(C).unwrap().kind,
        TransferErrorKind::DnsResolution
    );
    assert!(sink.body_for(C).unwrap().is_empty());

    assert_eq!(stats.registered, 3);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.bytes_received, 11);
    assert_eq!(coordinator.session_count(), 0);
    assert_eq!(coordinator.engine().removed.len(), 3);
}

#[test]
fn test_removed_socket_gets_no_more_readiness() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(A, vec![Reaction::watch(A, 7, Interest::READABLE)])
        .on_socket(7, vec![Reaction::remove(A, 7), Reaction::timer_ms(50)])
        .on_timeout(vec![Reaction::Data(A, b"tail"), Reaction::done(A)]);

    let mut coordinator = coordinator(engine);
    coordinator
        .reactor_mut()
        .ready(7, WatchKind::Readable)
        .ready(7, WatchKind::Readable);

    let id = coordinator.register(A).unwrap();
    assert_eq!(coordinator.reactor().armed(7), Interest::READABLE);

    assert!(coordinator.step().unwrap());
    assert!(!coordinator.reactor().is_open(7));
    let session = coordinator.session(id).unwrap();
    assert!(!session.is_completed());
    assert_eq!(session.watch().state(), WatchState::Removed(7));

    // The timer completes the transfer; the second readiness is never seen
    assert!(coordinator.step().unwrap());
    assert!(coordinator.session(id).is_none());
    assert!(!coordinator.step().unwrap());

    assert_eq!(coordinator.reactor().deliveries(7), 1);
    assert_eq!(coordinator.engine().socket_drives(7), 1);
    assert_eq!(coordinator.sink().count_for(A), 1);
    assert_eq!(coordinator.sink().body_for(A).unwrap().as_ref(), b"tail");
}

#[test]
fn test_zero_delay_timer_runs_on_next_turn() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(A, vec![Reaction::watch(A, 5, Interest::READABLE)])
        .on_socket(5, vec![Reaction::timer_ms(0)])
        .on_timeout(vec![
            Reaction::Data(A, b"ok"),
            Reaction::done(A),
            Reaction::remove(A, 5),
        ]);

    let mut coordinator = coordinator(engine);
    coordinator.reactor_mut().ready(5, WatchKind::Readable);
    coordinator.register(A).unwrap();

    assert!(coordinator.step().unwrap());
    // Only the socket action ran; the wake-up is posted, not executed
    assert_eq!(
        coordinator.engine().drives,
        vec![DriveAction::Socket {
            socket: 5,
            event: SocketEvent::Readable
        }]
    );
    let timer = coordinator.retry_timer().unwrap();
    assert_eq!(coordinator.reactor().count(&Op::Defer(timer)), 1);
    // Still wanted, so the fired kind is armed again
    assert_eq!(coordinator.reactor().armed(5), Interest::READABLE);

    assert!(coordinator.step().unwrap());
    assert_eq!(coordinator.engine().drives.len(), 2);
    assert_eq!(coordinator.engine().drives[1], DriveAction::Timeout);
    assert_eq!(coordinator.sink().count_for(A), 1);
    assert!(!coordinator.step().unwrap());
}

#[test]
fn test_idle_engine_cancels_retry_timer() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(A, vec![Reaction::timer_ms(1000)])
        .on_timeout(vec![
            Reaction::watch(A, 5, Interest::READABLE),
            Reaction::timer_ms(1000),
        ])
        .on_socket(
            5,
            vec![
                Reaction::Data(A, b"body"),
                Reaction::done(A),
                Reaction::timer_ms(500),
            ],
        );

    let mut coordinator = coordinator(engine);
    coordinator.reactor_mut().ready(5, WatchKind::Readable);
    coordinator.register(A).unwrap();

    let stats = coordinator.run().unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(coordinator.active_count(), 0);
    assert!(!coordinator.has_retry_timer());
    assert_eq!(coordinator.reactor().pending_timers(), 0);
    // The 500ms wake-up requested with the last completion never fires
    assert_eq!(coordinator.reactor().now(), Duration::from_millis(1000));
    assert_eq!(coordinator.engine().timeout_drives(), 1);
    assert!(!coordinator.reactor().is_open(5));
}

#[test]
fn test_new_timer_request_supersedes_pending_one() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(A, vec![Reaction::timer_ms(100)])
        .on_add(B, vec![Reaction::timer_ms(50)])
        .on_timeout(vec![
            Reaction::Timer(None),
            Reaction::done(A),
            Reaction::done(B),
        ]);

    let mut coordinator = coordinator(engine);
    coordinator.register(A).unwrap();
    coordinator.register(B).unwrap();

    let first = TimerId::new(1);
    assert_eq!(coordinator.reactor().pending_timers(), 1);
    assert_eq!(coordinator.reactor().count(&Op::Cancel(first)), 1);
    assert_eq!(coordinator.retry_timer(), Some(TimerId::new(2)));

    let stats = coordinator.run().unwrap();
    assert_eq!(stats.succeeded, 2);
    assert_eq!(coordinator.reactor().now(), Duration::from_millis(50));
    assert_eq!(coordinator.reactor().count(&Op::Fire(first)), 0);
    assert_eq!(coordinator.engine().timeout_drives(), 1);
}

#[test]
fn test_armed_kinds_follow_declared_interest() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(
            A,
            vec![Reaction::watch(A, 5, Interest::BOTH), Reaction::timer_ms(10)],
        )
        .on_timeout(vec![
            Reaction::watch(A, 5, Interest::BOTH),
            Reaction::watch(A, 5, Interest::WRITABLE),
            Reaction::timer_ms(10),
        ]);

    let mut coordinator = coordinator(engine);
    let id = coordinator.register(A).unwrap();
    assert_eq!(coordinator.reactor().armed(5), Interest::BOTH);
    assert_eq!(coordinator.reactor().count(&Op::Open(5)), 1);

    // Repeating the same interest never double-arms
    assert!(coordinator.step().unwrap());
    let reactor = coordinator.reactor();
    assert_eq!(reactor.count(&Op::Watch(5, WatchKind::Readable)), 1);
    assert_eq!(reactor.count(&Op::Watch(5, WatchKind::Writable)), 1);
    assert_eq!(reactor.count(&Op::Unwatch(5, WatchKind::Readable)), 1);
    assert_eq!(reactor.armed(5), Interest::WRITABLE);
    let session = coordinator.session(id).unwrap();
    assert_eq!(session.pending(), Interest::WRITABLE);
    assert_eq!(session.watch().armed(), Interest::WRITABLE);

    // Fired and still wanted: armed again, nothing else
    coordinator.reactor_mut().ready(5, WatchKind::Writable);
    assert!(coordinator.step().unwrap());
    let reactor = coordinator.reactor();
    assert_eq!(reactor.count(&Op::Watch(5, WatchKind::Writable)), 2);
    assert_eq!(reactor.count(&Op::Watch(5, WatchKind::Readable)), 1);
    assert_eq!(reactor.armed(5), Interest::WRITABLE);

    coordinator.reactor_mut().ready(5, WatchKind::Writable);
    coordinator
        .engine_mut()
        .on_socket(5, vec![Reaction::done(A), Reaction::remove(A, 5)]);
    let stats = coordinator.run().unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(coordinator.session_count(), 0);
    assert_eq!(coordinator.reactor().pending_timers(), 0);
}

#[test]
fn test_completed_session_with_pending_wait_is_deleted_on_readiness() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(
            A,
            vec![Reaction::watch(A, 5, Interest::READABLE), Reaction::timer_ms(1)],
        )
        .on_timeout(vec![Reaction::done(A), Reaction::done(A)]);

    let mut coordinator = coordinator(engine);
    let id = coordinator.register(A).unwrap();

    // Completion while the readable wait is still armed
    assert!(coordinator.step().unwrap());
    assert_eq!(coordinator.sink().count_for(A), 1);
    let session = coordinator.session(id).unwrap();
    assert!(session.is_completed());
    assert!(session.watch().has_pending_wait());
    assert!(coordinator.engine().removed.is_empty());

    coordinator.reactor_mut().ready(5, WatchKind::Readable);
    assert!(coordinator.step().unwrap());
    assert!(coordinator.session(id).is_none());
    assert_eq!(coordinator.engine().removed, vec![id]);
    assert!(!coordinator.reactor().is_open(5));

    // A late event for the deleted session is dropped without touching the engine
    let drives = coordinator.engine().drives.len();
    coordinator.reactor_mut().inject(ReactorEvent::SocketReady {
        session: id,
        socket: 5,
        kind: WatchKind::Readable,
        error: None,
    });
    assert!(coordinator.step().unwrap());
    assert_eq!(coordinator.engine().drives.len(), drives);
    assert!(!coordinator.step().unwrap());

    assert_eq!(coordinator.sink().count_for(A), 1);
    assert_eq!(coordinator.stats().succeeded, 1);
}

#[test]
fn test_duplicate_completion_after_delete_is_dropped() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(A, vec![Reaction::timer_ms(1)])
        .on_timeout(vec![Reaction::done(A), Reaction::done(A)]);

    let mut coordinator = coordinator(engine);
    coordinator.register(A).unwrap();
    let stats = coordinator.run().unwrap();

    assert_eq!(coordinator.sink().count_for(A), 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(coordinator.engine().removed.len(), 1);
}

#[test]
fn test_socket_recreated_for_same_session() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(A, vec![Reaction::watch(A, 5, Interest::WRITABLE)])
        .on_socket(
            5,
            vec![
                Reaction::remove(A, 5),
                Reaction::watch(A, 9, Interest::READABLE),
            ],
        )
        .on_socket(
            9,
            vec![
                Reaction::Data(A, b"second try"),
                Reaction::done(A),
                Reaction::remove(A, 9),
            ],
        );

    let mut coordinator = coordinator(engine);
    coordinator
        .reactor_mut()
        .ready(5, WatchKind::Writable)
        .ready(9, WatchKind::Readable);
    coordinator.register(A).unwrap();
    coordinator.run().unwrap();

    let ops = &coordinator.reactor().ops;
    let position = |op: Op| ops.iter().position(|o| *o == op).unwrap();
    assert!(position(Op::Close(5)) < position(Op::Open(9)));
    assert!(position(Op::Open(9)) < position(Op::Close(9)));
    assert_eq!(
        coordinator.sink().body_for(A).unwrap().as_ref(),
        b"second try"
    );
}

#[test]
fn test_socket_reused_after_remove() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(A, vec![Reaction::watch(A, 5, Interest::WRITABLE)])
        .on_socket(
            5,
            vec![
                Reaction::remove(A, 5),
                Reaction::watch(A, 5, Interest::READABLE),
            ],
        )
        .on_socket(5, vec![Reaction::done(A), Reaction::remove(A, 5)]);

    let mut coordinator = coordinator(engine);
    coordinator
        .reactor_mut()
        .ready(5, WatchKind::Writable)
        .ready(5, WatchKind::Readable);
    coordinator.register(A).unwrap();
    coordinator.run().unwrap();

    assert_eq!(coordinator.reactor().count(&Op::Open(5)), 2);
    assert_eq!(coordinator.sink().count_for(A), 1);
}

#[test]
fn test_second_socket_for_open_watch_is_fatal() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(
            A,
            vec![Reaction::watch(A, 5, Interest::READABLE), Reaction::timer_ms(1)],
        )
        .on_timeout(vec![Reaction::watch(A, 6, Interest::WRITABLE)]);

    let mut coordinator = coordinator(engine);
    let id = coordinator.register(A).unwrap();

    let err = coordinator.run().unwrap_err();
    match err {
        MultiplexError::SocketConsistency {
            session,
            expected,
            actual,
        } => {
            assert_eq!(session, id);
            assert_eq!(expected, Some(5));
            assert_eq!(actual, 6);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(coordinator.sink().deliveries.is_empty());
}

#[test]
fn test_reactor_handle_mismatch_is_fatal() {
    let mut engine = ScriptedEngine::new();
    engine.on_add(A, vec![Reaction::watch(A, 5, Interest::READABLE)]);

    let mut coordinator = coordinator(engine);
    coordinator.reactor_mut().handle_offset = 100;

    let err = coordinator.register(A).unwrap_err();
    assert!(matches!(
        err,
        MultiplexError::SocketConsistency {
            expected: Some(105),
            actual: 5,
            ..
        }
    ));
    assert!(err.is_fatal());
    assert!(!coordinator.reactor().is_open(105));
}

#[test]
fn test_readiness_on_foreign_socket_is_fatal() {
    let mut engine = ScriptedEngine::new();
    engine.on_add(A, vec![Reaction::watch(A, 5, Interest::READABLE)]);

    let mut coordinator = coordinator(engine);
    let id = coordinator.register(A).unwrap();
    coordinator.reactor_mut().inject(ReactorEvent::SocketReady {
        session: id,
        socket: 8,
        kind: WatchKind::Readable,
        error: None,
    });

    let err = coordinator.step().unwrap_err();
    assert!(matches!(err, MultiplexError::SocketConsistency { actual: 8, .. }));
    assert!(coordinator.engine().drives.is_empty());
}

#[test]
fn test_socket_without_owner_is_ignored() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(
            A,
            vec![
                Reaction::Socket {
                    owner: None,
                    socket: 8,
                    wants: multifetch::SocketWants::Watch(Interest::READABLE),
                },
                Reaction::timer_ms(1),
            ],
        )
        .on_timeout(vec![Reaction::done(A)]);

    let mut coordinator = coordinator(engine);
    coordinator.register(A).unwrap();
    coordinator.run().unwrap();

    assert_eq!(coordinator.reactor().count(&Op::Open(8)), 0);
    assert_eq!(coordinator.sink().count_for(A), 1);
}

#[test]
fn test_socket_error_drives_error_event() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(A, vec![Reaction::watch(A, 5, Interest::READABLE)])
        .on_socket(
            5,
            vec![
                Reaction::failed(A, TransferErrorKind::Other, "Recv failure: Connection reset by peer"),
                Reaction::remove(A, 5),
            ],
        );

    let mut coordinator = coordinator(engine);
    coordinator
        .reactor_mut()
        .ready_with_error(5, WatchKind::Readable);
    coordinator.register(A).unwrap();
    let stats = coordinator.run().unwrap();

    assert_eq!(
        coordinator.engine().drives,
        vec![DriveAction::Socket {
            socket: 5,
            event: SocketEvent::Error
        }]
    );
    assert_eq!(stats.failed, 1);
    assert!(coordinator.sink().error_for(A).is_some());
}

#[test]
fn test_drive_error_is_recoverable() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(A, vec![Reaction::timer_ms(1)])
        .on_timeout(vec![Reaction::Fail("bad socket"), Reaction::timer_ms(1)])
        .on_timeout(vec![Reaction::Data(A, b"late"), Reaction::done(A)]);

    let mut coordinator = coordinator(engine);
    coordinator.register(A).unwrap();
    let stats = coordinator.run().unwrap();

    assert_eq!(stats.drive_errors, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(coordinator.engine().timeout_drives(), 2);
    assert_eq!(coordinator.sink().body_for(A).unwrap().as_ref(), b"late");
}

#[test]
fn test_invalid_url_creates_no_session() {
    let mut coordinator = coordinator(ScriptedEngine::new());

    let err = coordinator.register("not a url").unwrap_err();
    assert!(matches!(err, MultiplexError::TransferSetup { .. }));
    assert!(!err.is_fatal());
    assert_eq!(coordinator.session_count(), 0);
    assert_eq!(coordinator.stats().registered, 0);
    assert!(coordinator.engine().session_for("not a url").is_none());
}

#[test]
fn test_engine_rejection_releases_slot() {
    let mut engine = ScriptedEngine::new();
    engine.reject(A).on_add(B, vec![Reaction::timer_ms(1)]);
    engine.on_timeout(vec![Reaction::done(B)]);

    let mut coordinator = coordinator(engine);
    let err = coordinator.register(A).unwrap_err();
    assert!(matches!(err, MultiplexError::TransferSetup { ref url, .. } if url == A));
    assert_eq!(coordinator.session_count(), 0);

    // The released slot is reused under a new generation
    let id = coordinator.register(B).unwrap();
    assert_eq!(id.index(), 0);
    assert_eq!(id.generation(), 1);

    let stats = coordinator.run().unwrap();
    assert_eq!(stats.registered, 1);
    assert_eq!(coordinator.sink().deliveries.len(), 1);
}

#[test]
fn test_session_limit() {
    let config = MultiplexConfig::new().max_sessions(1);
    let mut coordinator = multifetch::Coordinator::with_config(
        ScriptedEngine::new(),
        FakeReactor::new(),
        RecordingSink::new(),
        &config,
    );

    coordinator.register(A).unwrap();
    let err = coordinator.register(B).unwrap_err();
    assert!(matches!(
        err,
        MultiplexError::ResourceLimit {
            resource: "sessions",
            limit: 1
        }
    ));
}

#[test]
fn test_closure_sink_receives_results() {
    let mut engine = ScriptedEngine::new();
    engine
        .on_add(A, vec![Reaction::timer_ms(0)])
        .on_timeout(vec![Reaction::Data(A, b"abc"), Reaction::done(A)]);

    let mut received = Vec::new();
    {
        let sink = |url: &str, body: bytes::Bytes, error: Option<multifetch::TransferError>| {
            received.push((url.to_string(), body.len(), error.is_none()));
        };
        let mut coordinator = multifetch::Coordinator::new(engine, FakeReactor::new(), sink);
        coordinator.register(A).unwrap();
        coordinator.run().unwrap();
    }

    assert_eq!(received, vec![(A.to_string(), 3, true)]);
}
