//! Breakpoint registry behavior against a scripted target.

use crate::common::{self, expect_quiet, recv_event, MockVm, Op};
use remdbg::debugger::{ArmState, Event, HitPolicy, LocationSpec, ThreadId, ThreadStatus};

#[test]
fn test_breakpoint_added_before_class_load_arms_on_prepare() {
    common::init_logger();
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .script(vec![
            Op::AwaitSignal,
            Op::LoadClass("app.Main"),
            Op::AwaitArmed(1),
            Op::ExecuteLine {
                thread: 1,
                class: "app.Main",
                line: 10,
            },
        ])
        .launch();
    let mut debugger = common::attach(link);
    let sub = debugger.subscribe();

    // accepted although the class is not loaded
    let id = debugger
        .add_breakpoint(LocationSpec::line("app.Main", 10), HitPolicy::Always)
        .unwrap();
    assert_eq!(debugger.breakpoints()[0].state, ArmState::Pending);

    vm.signal();
    assert!(matches!(recv_event(&sub), Event::ClassPrepared { .. }));
    let hit = recv_event(&sub);
    assert!(matches!(
        hit,
        Event::BreakpointHit {
            thread: ThreadId(1),
            ..
        }
    ));

    let bp = debugger.breakpoints().remove(0);
    assert_eq!(bp.number, id);
    assert!(matches!(bp.state, ArmState::Armed { .. }));
    assert_eq!(bp.hits, 1);

    let snap = debugger.thread_state(ThreadId(1)).unwrap();
    assert_eq!(snap.status, ThreadStatus::Suspended);
    assert_eq!(snap.suspend_depth, 1);

    debugger.continue_thread(ThreadId(1)).unwrap();
    let snap = debugger.thread_state(ThreadId(1)).unwrap();
    assert_eq!(snap.status, ThreadStatus::Running);
    assert_eq!(snap.suspend_depth, 0);

    debugger.detach().unwrap();
}

#[test]
fn test_ignored_hits_resume_silently() {
    common::init_logger();
    let line = Op::ExecuteLine {
        thread: 1,
        class: "app.Main",
        line: 10,
    };
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .with_class("app.Main")
        .script(vec![Op::AwaitSignal, line.clone(), line])
        .launch();
    let mut debugger = common::attach(link);
    let sub = debugger.subscribe();

    debugger
        .add_breakpoint(LocationSpec::line("app.Main", 10), HitPolicy::IgnoreCount(1))
        .unwrap();
    // class already loaded, armed synchronously
    assert!(matches!(
        debugger.breakpoints()[0].state,
        ArmState::Armed { .. }
    ));

    vm.signal();
    // the first hit is a non-event, only the second one is published
    assert!(matches!(recv_event(&sub), Event::BreakpointHit { .. }));
    expect_quiet(&sub);

    let snap = debugger.thread_state(ThreadId(1)).unwrap();
    assert_eq!(snap.suspend_depth, 1);
    assert_eq!(debugger.breakpoints()[0].hits, 2);
    // the ignored hit was resumed behind the operator's back
    assert_eq!(vm.command_count("resume"), 1);

    debugger.detach().unwrap();
}

#[test]
fn test_one_shot_breakpoint_retires_after_first_stop() {
    common::init_logger();
    let line = Op::ExecuteLine {
        thread: 1,
        class: "app.Main",
        line: 10,
    };
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .with_class("app.Main")
        .script(vec![Op::AwaitSignal, line.clone(), Op::AwaitSignal, line])
        .launch();
    let mut debugger = common::attach(link);
    let sub = debugger.subscribe();

    debugger
        .add_breakpoint(LocationSpec::line("app.Main", 10), HitPolicy::Once)
        .unwrap();

    vm.signal();
    assert!(matches!(recv_event(&sub), Event::BreakpointHit { .. }));
    // gone from the registry and cleared on the target
    assert!(debugger.breakpoints().is_empty());
    assert_eq!(vm.command_count("clear-breakpoint"), 1);

    debugger.continue_thread(ThreadId(1)).unwrap();
    vm.signal();
    // the same line executes again without stopping
    expect_quiet(&sub);

    debugger.detach().unwrap();
}

#[test]
fn test_class_unload_unarms_and_reload_rearms() {
    common::init_logger();
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .with_class("app.Main")
        .script(vec![
            Op::AwaitSignal,
            Op::UnloadClass("app.Main"),
            Op::AwaitSignal,
            Op::LoadClass("app.Main"),
            Op::AwaitArmed(1),
            Op::ExecuteLine {
                thread: 1,
                class: "app.Main",
                line: 10,
            },
        ])
        .launch();
    let mut debugger = common::attach(link);
    let sub = debugger.subscribe();

    debugger
        .add_breakpoint(LocationSpec::line("app.Main", 10), HitPolicy::Always)
        .unwrap();
    assert!(matches!(
        debugger.breakpoints()[0].state,
        ArmState::Armed { .. }
    ));

    vm.signal();
    assert!(matches!(recv_event(&sub), Event::ClassUnloaded { .. }));
    // still registered, just not armed anymore
    assert_eq!(debugger.breakpoints()[0].state, ArmState::Unarmed);

    vm.signal();
    assert!(matches!(recv_event(&sub), Event::ClassPrepared { .. }));
    assert!(matches!(recv_event(&sub), Event::BreakpointHit { .. }));
    assert_eq!(
        debugger.thread_state(ThreadId(1)).unwrap().status,
        ThreadStatus::Suspended
    );

    debugger.detach().unwrap();
}

#[test]
fn test_disabled_breakpoint_does_not_stop() {
    common::init_logger();
    let line = Op::ExecuteLine {
        thread: 1,
        class: "app.Main",
        line: 10,
    };
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .with_class("app.Main")
        .script(vec![Op::AwaitSignal, line.clone(), Op::AwaitSignal, line])
        .launch();
    let mut debugger = common::attach(link);
    let sub = debugger.subscribe();

    let id = debugger
        .add_breakpoint(LocationSpec::line("app.Main", 10), HitPolicy::Always)
        .unwrap();
    debugger.disable_breakpoint(id).unwrap();
    assert_eq!(vm.command_count("clear-breakpoint"), 1);

    vm.signal();
    expect_quiet(&sub);

    // re-enabling arms again right away, the class is loaded
    debugger.enable_breakpoint(id).unwrap();
    assert!(matches!(
        debugger.breakpoints()[0].state,
        ArmState::Armed { .. }
    ));
    vm.signal();
    assert!(matches!(recv_event(&sub), Event::BreakpointHit { .. }));

    debugger.detach().unwrap();
}

#[test]
fn test_failed_resolution_leaves_breakpoint_pending() {
    common::init_logger();
    let (link, _vm) = MockVm::new().with_thread(1).with_class("app.Main").launch();
    let mut debugger = common::attach(link);

    // line 0 resolves to a target error reply
    let id = debugger
        .add_breakpoint(LocationSpec::line("app.Main", 0), HitPolicy::Always)
        .unwrap();
    let bp = debugger.breakpoints().remove(0);
    assert_eq!(bp.number, id);
    assert_eq!(bp.state, ArmState::Pending);

    debugger.detach().unwrap();
}

#[test]
fn test_exception_watch_stops_matching_throws() {
    common::init_logger();
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .script(vec![
            Op::AwaitSignal,
            Op::Throw {
                thread: 1,
                class: "java.lang.IllegalStateException",
                message: "boom",
            },
            Op::AwaitSignal,
            Op::Throw {
                thread: 1,
                class: "java.lang.IllegalStateException",
                message: "again",
            },
        ])
        .launch();
    let mut debugger = common::attach(link);
    let sub = debugger.subscribe();

    let watch = debugger.add_exception_watch("java.lang.*").unwrap();
    assert_eq!(debugger.exception_watches().len(), 1);

    vm.signal();
    let thrown = recv_event(&sub);
    assert!(matches!(
        thrown,
        Event::ExceptionThrown {
            thread: ThreadId(1),
            ..
        }
    ));
    let snap = debugger.thread_state(ThreadId(1)).unwrap();
    assert_eq!(snap.status, ThreadStatus::Suspended);
    assert_eq!(snap.suspend_depth, 1);

    debugger.continue_thread(ThreadId(1)).unwrap();
    debugger.remove_exception_watch(watch).unwrap();
    assert_eq!(vm.command_count("clear-exception-watch"), 1);

    // with the watch gone the throw passes unobserved
    vm.signal();
    expect_quiet(&sub);

    debugger.detach().unwrap();
}
