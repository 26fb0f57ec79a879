//! Whole single-shot runs through the session state machine.

use h264_pump::capture::FrameLayout;
use h264_pump::encoder::ComponentState;
use h264_pump::error::{exit, LifecycleStep, SessionError};
use h264_pump::pipeline::{PumpOptions, PumpState, Session, SessionSettings, StopReason};

use crate::helpers::{
    component, init_test_tracing, request, FaultyEncoder, MemorySource, RecordingPublisher,
    TestComponent,
};

fn settings(width: u32, height: u32) -> SessionSettings {
    SessionSettings {
        request: request(width, height),
        options: PumpOptions {
            sender_stamp: 3,
            verbose: false,
        },
    }
}

fn session(encoder: FaultyEncoder<TestComponent>) -> Session<FaultyEncoder<TestComponent>> {
    Session::new(encoder, settings(64, 48))
}

#[test]
fn full_run_publishes_every_frame_and_tears_down() {
    init_test_tracing();
    let source = MemorySource::numbered(FrameLayout::new(64, 48), 5);
    let publisher = RecordingPublisher::default();
    let encoder = FaultyEncoder::new(component(&[32]));
    let calls = encoder.calls.clone();
    let mut session = session(encoder);

    let summary = session.run(&source, &publisher).unwrap();
    assert_eq!(summary.reason, StopReason::SourceLost);
    assert_eq!(summary.stats.published, 5);
    assert_eq!(summary.ports.input.stride, 64);
    assert_eq!(summary.teardown.steps_attempted, 5);
    assert!(summary.teardown.is_clean());
    assert_eq!(session.state(), PumpState::Terminated);
    assert!(session.lifecycle().is_released());

    let inner = &session.lifecycle().encoder().inner;
    assert_eq!(inner.state(), ComponentState::Loaded);
    assert_eq!(inner.compressor().configured.map(|c| (c.1, c.2)), Some((1_000_000, 10)));
    assert_eq!(publisher.sent.borrow().len(), 5);
    assert!(publisher.sent.borrow().iter().all(|s| s.sender_stamp == 3));

    let calls = calls.borrow();
    assert_eq!(
        calls[calls.len() - 5..],
        [
            "disable_port_buffers(200)",
            "disable_port_buffers(201)",
            "change_state(idle)",
            "change_state(loaded)",
            "release"
        ]
    );
}

#[test]
fn invalid_source_never_touches_the_encoder() {
    init_test_tracing();
    let source = MemorySource::new(Vec::new());
    let publisher = RecordingPublisher::default();
    let encoder = FaultyEncoder::new(component(&[32]));
    let calls = encoder.calls.clone();
    let mut session = session(encoder);

    let err = session.run(&source, &publisher).unwrap_err();
    assert!(matches!(err, SessionError::SourceUnavailable(ref name) if name == "memory"));
    assert_eq!(err.exit_code(), exit::SHARED_MEMORY);
    assert_eq!(session.state(), PumpState::Terminated);
    assert_eq!(session.teardown_report().map(|r| r.steps_attempted), Some(1));
    assert_eq!(*calls.borrow(), ["release"]);
    assert_eq!(source.waits(), 0);
}

#[test]
fn negotiation_failure_skips_bring_up() {
    init_test_tracing();
    let source = MemorySource::numbered(FrameLayout::new(64, 48), 1);
    let publisher = RecordingPublisher::default();
    let encoder = FaultyEncoder::new(component(&[32])).failing("set_compression_format");
    let calls = encoder.calls.clone();
    let mut session = session(encoder);

    let err = session.run(&source, &publisher).unwrap_err();
    assert!(matches!(err, SessionError::Negotiation(_)));
    assert_eq!(err.exit_code(), exit::BRING_UP);
    assert!(!calls.borrow().iter().any(|c| c.starts_with("change_state")));
    assert_eq!(calls.borrow().last().map(String::as_str), Some("release"));
    assert_eq!(source.waits(), 0);
}

#[test]
fn failed_bring_up_undoes_only_what_was_done() {
    init_test_tracing();
    let source = MemorySource::numbered(FrameLayout::new(64, 48), 1);
    let publisher = RecordingPublisher::default();
    let encoder = FaultyEncoder::new(component(&[32])).failing("enable_port_buffers(201)");
    let calls = encoder.calls.clone();
    let mut session = session(encoder);

    let err = session.run(&source, &publisher).unwrap_err();
    match &err {
        SessionError::Lifecycle(e) => assert_eq!(e.step, LifecycleStep::EnableOutput),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.exit_code(), exit::BRING_UP);

    let report = session.teardown_report().unwrap();
    assert!(report.is_clean());
    let calls = calls.borrow();
    assert_eq!(
        calls[calls.len() - 3..],
        ["disable_port_buffers(200)", "change_state(loaded)", "release"]
    );
    assert!(publisher.sent.borrow().is_empty());
}

#[test]
fn a_session_runs_once() {
    init_test_tracing();
    let source = MemorySource::numbered(FrameLayout::new(64, 48), 1);
    let publisher = RecordingPublisher::default();
    let mut session = session(FaultyEncoder::new(component(&[32])));

    session.run(&source, &publisher).unwrap();
    let err = session.run(&source, &publisher).unwrap_err();
    assert!(matches!(err, SessionError::AlreadyRun));
}

#[test]
fn bus_stop_drains_and_terminates() {
    init_test_tracing();
    let source = MemorySource::numbered(FrameLayout::new(64, 48), 10);
    let publisher = RecordingPublisher::stopping_after(4);
    let mut session = session(FaultyEncoder::new(component(&[32])));

    let summary = session.run(&source, &publisher).unwrap();
    assert_eq!(summary.reason, StopReason::BusStopped);
    assert_eq!(summary.stats.iterations, 4);
    assert!(summary.teardown.is_clean());
    assert_eq!(session.state(), PumpState::Terminated);
}
