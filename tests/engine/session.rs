//! Session lifecycle and transport-level behavior.

use crate::common::{self, expect_quiet, recv_event, MockVm, Op, EVENT_TIMEOUT, REPLY_TIMEOUT};
use remdbg::debugger::proto::transport::Transport;
use remdbg::debugger::{
    AttachOptions, Debugger, Error, Event, HitPolicy, LocationSpec, ThreadId, ThreadStatus,
};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

#[test]
fn test_command_timeout_is_not_retried() {
    common::init_logger();
    let (link, vm) = MockVm::new().with_thread(1).swallow("suspend-all").launch();
    let mut debugger = common::attach(link);

    let err = debugger.suspend_all().unwrap_err();
    assert!(matches!(err, Error::CommandTimeout("suspend-all", _)));
    // exactly one command went out, no automatic retry
    assert_eq!(vm.command_count("suspend-all"), 1);
    // nothing was committed engine-side
    let snap = debugger.thread_state(ThreadId(1)).unwrap();
    assert_eq!(snap.status, ThreadStatus::Running);
    assert_eq!(snap.suspend_depth, 0);

    debugger.detach().unwrap();
}

#[test]
fn test_malformed_event_is_dropped_and_stream_continues() {
    common::init_logger();
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .script(vec![Op::AwaitSignal, Op::Garbage, Op::LoadClass("app.Main")])
        .launch();
    let mut debugger = common::attach(link);
    let sub = debugger.subscribe();

    vm.signal();
    // the undecodable frame disappears, the next event is delivered normally
    assert_eq!(
        recv_event(&sub),
        Event::ClassPrepared {
            class: "app.Main".into()
        }
    );

    debugger.detach().unwrap();
}

#[test]
fn test_detach_is_idempotent_and_fails_further_commands() {
    common::init_logger();
    let (link, vm) = MockVm::new().with_thread(1).launch();
    let mut debugger = common::attach(link);

    debugger.detach().unwrap();
    debugger.detach().unwrap();
    assert_eq!(vm.command_count("dispose"), 1);

    assert!(matches!(debugger.suspend_all(), Err(Error::SessionDetached)));
    assert!(matches!(
        debugger.add_breakpoint(LocationSpec::line("app.Main", 1), HitPolicy::Always),
        Err(Error::SessionDetached)
    ));
}

#[test]
fn test_target_exit_ends_the_session() {
    common::init_logger();
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .with_thread(2)
        .script(vec![Op::AwaitSignal, Op::Exit(3)])
        .launch();
    let debugger = common::attach(link);
    let sub = debugger.subscribe();

    vm.signal();
    assert_eq!(recv_event(&sub), Event::TargetExit { code: 3 });
    // no more events ever
    expect_quiet(&sub);

    for snap in debugger.threads() {
        assert_eq!(snap.status, ThreadStatus::Exited);
        assert_eq!(snap.suspend_depth, 0);
    }
    assert!(matches!(
        debugger.suspend_thread(ThreadId(1)),
        Err(Error::SessionDetached)
    ));
}

#[test]
fn test_tcp_attach_rejects_bad_handshake() {
    common::init_logger();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut preamble = [0u8; 14];
        stream.read_exact(&mut preamble).unwrap();
        stream.write_all(b"NOPE-Handshake").unwrap();
    });

    assert!(matches!(
        Debugger::attach_tcp(addr, AttachOptions::default()),
        Err(Error::Handshake)
    ));
    server.join().unwrap();
}

#[test]
fn test_failed_attach_releases_the_transport() {
    common::init_logger();
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .swallow("list-threads")
        .launch();
    let transport = Transport::start(link, REPLY_TIMEOUT);

    assert!(matches!(
        Debugger::attach(transport, AttachOptions::default()),
        Err(Error::CommandTimeout("list-threads", _))
    ));
    // the wire was closed, so the target sees its pipe shut down and stops
    assert!(vm.wait_exit(EVENT_TIMEOUT));
}

#[test]
fn test_detach_does_not_wait_for_a_slow_subscriber() {
    common::init_logger();
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .script(vec![
            Op::AwaitSignal,
            Op::LoadClass("app.A"),
            Op::LoadClass("app.B"),
            Op::LoadClass("app.C"),
        ])
        .launch();
    let transport = Transport::start(link, REPLY_TIMEOUT);
    let mut debugger = Debugger::attach(
        transport,
        AttachOptions {
            reply_timeout: REPLY_TIMEOUT,
            notify_capacity: 1,
        },
    )
    .unwrap();
    let sub = debugger.subscribe();

    vm.signal();
    assert!(matches!(recv_event(&sub), Event::ClassPrepared { .. }));
    // one more event fits the queue, the loop then blocks on the next
    thread::sleep(Duration::from_millis(100));

    // must return even though the subscription is full and never drained
    debugger.detach().unwrap();
    assert_eq!(
        recv_event(&sub),
        Event::ClassPrepared {
            class: "app.B".into()
        }
    );
}
