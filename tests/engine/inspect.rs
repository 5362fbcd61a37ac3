//! Lazy frame and variable inspection with staleness detection.

use crate::common::{self, recv_event, MockVm, Op};
use remdbg::debugger::proto::FrameDescriptor;
use remdbg::debugger::variable::TypeTag;
use remdbg::debugger::{
    Error, Event, HitPolicy, Location, LocationSpec, ThreadId, Value, VariableBinding,
};

fn sample_frames() -> Vec<FrameDescriptor> {
    vec![
        FrameDescriptor {
            index: 0,
            location: Location::Line {
                class: "app.Main".into(),
                line: 10,
            },
        },
        FrameDescriptor {
            index: 1,
            location: Location::Method {
                class: "app.Main".into(),
                method: "main".into(),
                offset: 3,
            },
        },
    ]
}

fn sample_locals() -> Vec<VariableBinding> {
    vec![
        VariableBinding {
            name: "count".into(),
            tag: TypeTag::Int,
            value: Value::Int(5),
        },
        VariableBinding {
            name: "label".into(),
            tag: TypeTag::Object,
            value: Value::Null,
        },
    ]
}

#[test]
fn test_frames_and_locals_of_a_suspended_thread() {
    common::init_logger();
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .with_class("app.Main")
        .frames(sample_frames())
        .locals(sample_locals())
        .script(vec![Op::AwaitSignal, Op::ExecuteLine {
            thread: 1,
            class: "app.Main",
            line: 10,
        }])
        .launch();
    let mut debugger = common::attach(link);
    let sub = debugger.subscribe();

    debugger
        .add_breakpoint(LocationSpec::line("app.Main", 10), HitPolicy::Always)
        .unwrap();
    vm.signal();
    assert!(matches!(recv_event(&sub), Event::BreakpointHit { .. }));

    let stack = debugger.frames(ThreadId(1)).unwrap();
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[0].index, 0);
    assert_eq!(stack[0].thread, ThreadId(1));
    assert_eq!(
        stack[0].location,
        Location::Line {
            class: "app.Main".into(),
            line: 10
        }
    );

    let vars = debugger.locals(&stack[0]).unwrap();
    assert_eq!(vars, sample_locals());

    debugger.detach().unwrap();
}

#[test]
fn test_frames_require_a_suspended_thread() {
    common::init_logger();
    let (link, _vm) = MockVm::new().with_thread(1).frames(sample_frames()).launch();
    let mut debugger = common::attach(link);

    assert!(matches!(
        debugger.frames(ThreadId(1)),
        Err(Error::InvalidContext)
    ));
    assert!(matches!(
        debugger.frames(ThreadId(9)),
        Err(Error::ThreadNotFound(_))
    ));

    debugger.detach().unwrap();
}

#[test]
fn test_frames_go_stale_once_the_thread_resumes() {
    common::init_logger();
    let line = Op::ExecuteLine {
        thread: 1,
        class: "app.Main",
        line: 10,
    };
    let (link, vm) = MockVm::new()
        .with_thread(1)
        .with_class("app.Main")
        .frames(sample_frames())
        .locals(sample_locals())
        .script(vec![Op::AwaitSignal, line.clone(), Op::AwaitSignal, line])
        .launch();
    let mut debugger = common::attach(link);
    let sub = debugger.subscribe();

    debugger
        .add_breakpoint(LocationSpec::line("app.Main", 10), HitPolicy::Always)
        .unwrap();
    vm.signal();
    assert!(matches!(recv_event(&sub), Event::BreakpointHit { .. }));
    let stack = debugger.frames(ThreadId(1)).unwrap();

    debugger.continue_thread(ThreadId(1)).unwrap();
    // the thread runs, the old stack answers invalid context
    assert!(matches!(
        debugger.locals(&stack[0]),
        Err(Error::InvalidContext)
    ));

    vm.signal();
    assert!(matches!(recv_event(&sub), Event::BreakpointHit { .. }));
    // suspended again, but this is a different suspension
    assert!(matches!(
        debugger.locals(&stack[0]),
        Err(Error::InvalidContext)
    ));
    // a fresh stack works
    let fresh = debugger.frames(ThreadId(1)).unwrap();
    assert_eq!(debugger.locals(&fresh[0]).unwrap(), sample_locals());

    debugger.detach().unwrap();
}
