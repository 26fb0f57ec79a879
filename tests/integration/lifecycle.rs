//! Bring-up order and best-effort teardown.

use h264_pump::encoder::lifecycle::TeardownReport;
use h264_pump::encoder::{negotiate, ComponentState, EncoderBackend, Lifecycle, PortPair};
use h264_pump::error::{EncoderError, LifecycleStep};

use crate::helpers::{component, executing, init_test_tracing, request, FaultyEncoder};

#[test]
fn bring_up_moves_through_idle_to_executing() {
    init_test_tracing();
    let encoder = FaultyEncoder::new(component(&[8]));
    let calls = encoder.calls.clone();
    let mut lifecycle = Lifecycle::new(encoder, PortPair::default());
    negotiate(lifecycle.encoder_mut(), &request(64, 48)).unwrap();
    calls.borrow_mut().clear();

    lifecycle.bring_up().unwrap();
    assert_eq!(lifecycle.state(), ComponentState::Executing);
    assert_eq!(
        *calls.borrow(),
        [
            "change_state(idle)",
            "enable_port_buffers(200)",
            "enable_port_buffers(201)",
            "change_state(executing)"
        ]
    );
}

#[test]
fn teardown_runs_once() {
    init_test_tracing();
    let (mut lifecycle, _) = executing(FaultyEncoder::new(component(&[8])), 64, 48);
    let calls = lifecycle.encoder().calls.clone();

    let first = lifecycle.tear_down();
    assert_eq!(first.steps_attempted, 5);
    assert!(first.is_clean());
    let after_first = calls.borrow().len();

    assert_eq!(lifecycle.tear_down(), TeardownReport::default());
    drop(lifecycle);
    assert_eq!(calls.borrow().len(), after_first);
}

#[test]
fn teardown_carries_on_past_failures() {
    init_test_tracing();
    let (mut lifecycle, _) = executing(FaultyEncoder::new(component(&[8])), 64, 48);
    let failing = &mut lifecycle.encoder_mut().failing;
    failing.insert("disable_port_buffers(200)".into());
    failing.insert("change_state(idle)".into());

    let report = lifecycle.tear_down();
    assert_eq!(report.steps_attempted, 5);
    let failed: Vec<LifecycleStep> = report.failures.iter().map(|f| f.step).collect();
    // The component never left Executing, so Loaded is refused as well.
    assert_eq!(
        failed,
        [
            LifecycleStep::DisableInput,
            LifecycleStep::ReturnToIdle,
            LifecycleStep::ReturnToLoaded
        ]
    );
    assert!(lifecycle.is_released());
    assert_eq!(
        lifecycle.encoder().calls().last().map(String::as_str),
        Some("release")
    );
}

#[test]
fn dropping_the_lifecycle_tears_down() {
    init_test_tracing();
    let (lifecycle, _) = executing(FaultyEncoder::new(component(&[8])), 64, 48);
    let calls = lifecycle.encoder().calls.clone();
    drop(lifecycle);
    assert_eq!(calls.borrow().last().map(String::as_str), Some("release"));
}

#[test]
fn released_component_cannot_be_brought_up_again() {
    init_test_tracing();
    let mut lifecycle = Lifecycle::new(component(&[8]), PortPair::default());
    lifecycle.tear_down();
    let err = lifecycle.prepare().unwrap_err();
    assert_eq!(err.step, LifecycleStep::EnterIdle);
    assert_eq!(err.source, EncoderError::Released);
}

#[test]
fn idle_to_executing_needs_both_pools() {
    init_test_tracing();
    let encoder = FaultyEncoder::new(component(&[8])).failing("enable_port_buffers(201)");
    let mut lifecycle = Lifecycle::new(encoder, PortPair::default());
    negotiate(lifecycle.encoder_mut(), &request(64, 48)).unwrap();

    let err = lifecycle.bring_up().unwrap_err();
    assert_eq!(err.step, LifecycleStep::EnableOutput);
    assert_eq!(lifecycle.state(), ComponentState::Idle);
    assert!(lifecycle.encoder_mut().inner.change_state(ComponentState::Executing).is_err());
}
