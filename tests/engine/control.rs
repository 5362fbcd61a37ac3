//! Execution control: suspend depth, stepping, batch commands.

use crate::common::{self, recv_event, MockVm, Op};
use remdbg::debugger::{Error, Event, HitPolicy, LocationSpec, StepKind, ThreadId, ThreadStatus};

#[test]
fn test_suspend_depth_reaches_zero_before_the_target_resumes() {
    common::init_logger();
    let (link, vm) = MockVm::new().with_thread(1).launch();
    let mut debugger = common::attach(link);
    let thread = ThreadId(1);

    debugger.suspend_thread(thread).unwrap();
    debugger.suspend_thread(thread).unwrap();
    assert_eq!(debugger.thread_state(thread).unwrap().suspend_depth, 2);
    assert_eq!(vm.command_count("suspend"), 2);

    // first release is engine-local, the thread stays suspended
    debugger.continue_thread(thread).unwrap();
    assert_eq!(debugger.thread_state(thread).unwrap().suspend_depth, 1);
    assert_eq!(vm.command_count("resume"), 0);

    // the last release actually resumes the target
    debugger.continue_thread(thread).unwrap();
    let snap = debugger.thread_state(thread).unwrap();
    assert_eq!(snap.suspend_depth, 0);
    assert_eq!(snap.status, ThreadStatus::Running);
    assert_eq!(vm.command_count("resume"), 1);

    // depth never goes negative
    assert!(matches!(
        debugger.continue_thread(thread),
        Err(Error::InvalidContext)
    ));
    // stepping a running thread is rejected too
    assert!(matches!(
        debugger.step(thread, StepKind::Into),
        Err(Error::InvalidContext)
    ));

    debugger.detach().unwrap();
}

#[test]
fn test_single_pending_step_per_thread() {
    common::init_logger();
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .with_class("app.Main")
        .script(vec![
            Op::AwaitSignal,
            Op::ExecuteLine {
                thread: 1,
                class: "app.Main",
                line: 10,
            },
            Op::AwaitSignal,
            Op::ExecuteLine {
                thread: 1,
                class: "app.Main",
                line: 11,
            },
        ])
        .launch();
    let mut debugger = common::attach(link);
    let sub = debugger.subscribe();
    let thread = ThreadId(1);

    debugger
        .add_breakpoint(LocationSpec::line("app.Main", 10), HitPolicy::Always)
        .unwrap();
    vm.signal();
    assert!(matches!(recv_event(&sub), Event::BreakpointHit { .. }));

    debugger.step(thread, StepKind::Over).unwrap();
    let snap = debugger.thread_state(thread).unwrap();
    assert_eq!(snap.status, ThreadStatus::Running);
    assert_eq!(snap.pending_step, Some(StepKind::Over));

    // only one outstanding step per thread
    assert!(matches!(
        debugger.step(thread, StepKind::Over),
        Err(Error::StepAlreadyPending(_))
    ));

    vm.signal();
    let done = recv_event(&sub);
    assert_eq!(
        done,
        Event::StepComplete {
            thread,
            location: remdbg::debugger::Location::Line {
                class: "app.Main".into(),
                line: 11
            }
        }
    );
    let snap = debugger.thread_state(thread).unwrap();
    assert_eq!(snap.status, ThreadStatus::Suspended);
    assert_eq!(snap.suspend_depth, 1);
    assert_eq!(snap.pending_step, None);

    // a new step is accepted once the previous one completed
    debugger.step(thread, StepKind::Into).unwrap();

    debugger.detach().unwrap();
}

#[test]
fn test_suspend_all_and_resume_all_update_every_thread() {
    common::init_logger();
    let (link, vm) = MockVm::new().with_thread(1).with_thread(2).launch();
    let mut debugger = common::attach(link);

    debugger.suspend_all().unwrap();
    for snap in debugger.threads() {
        assert_eq!(snap.status, ThreadStatus::Suspended);
        assert_eq!(snap.suspend_depth, 1);
    }
    assert_eq!(vm.command_count("suspend-all"), 1);

    debugger.resume_all().unwrap();
    for snap in debugger.threads() {
        assert_eq!(snap.status, ThreadStatus::Running);
        assert_eq!(snap.suspend_depth, 0);
    }
    assert_eq!(vm.command_count("resume-all"), 1);

    debugger.detach().unwrap();
}

#[test]
fn test_thread_lifecycle_is_tracked() {
    common::init_logger();
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .script(vec![
            Op::AwaitSignal,
            Op::StartThread(7),
            Op::EndThread(7),
        ])
        .launch();
    let mut debugger = common::attach(link);
    let sub = debugger.subscribe();

    assert!(matches!(
        debugger.thread_state(ThreadId(7)),
        Err(Error::ThreadNotFound(_))
    ));

    vm.signal();
    assert_eq!(
        recv_event(&sub),
        Event::ThreadStart { thread: ThreadId(7) }
    );
    assert_eq!(
        recv_event(&sub),
        Event::ThreadDeath { thread: ThreadId(7) }
    );

    let snap = debugger.thread_state(ThreadId(7)).unwrap();
    assert_eq!(snap.status, ThreadStatus::Exited);
    assert!(matches!(
        debugger.suspend_thread(ThreadId(7)),
        Err(Error::ThreadExited(_))
    ));

    debugger.detach().unwrap();
}
