//! Port negotiation against the in-process component.

use h264_pump::encoder::{negotiate, ColorFormat, PortDefinition, VideoCodec};
use h264_pump::error::{NegotiationError, Param};

use crate::helpers::{component, init_test_tracing, request, FaultyEncoder};

fn widen_stride(definition: &mut PortDefinition) {
    definition.geometry.stride += 32;
}

fn shrink_buffers(definition: &mut PortDefinition) {
    definition.buffer_size = 1024;
}

#[test]
fn full_hd_gets_aligned_slices() {
    init_test_tracing();
    let mut encoder = component(&[8]);
    let ports = negotiate(&mut encoder, &request(1920, 1080)).unwrap();

    assert_eq!(ports.input.stride, 1920);
    assert_eq!(ports.input.slice_height, 1088);
    assert_eq!(ports.input.color_format, ColorFormat::Yuv420PackedPlanar);
    assert_eq!(ports.input.frame_rate(), 30);
    assert!(ports.input_buffer_size >= 1920 * 1088 * 3 / 2);
    assert_eq!(ports.codec, VideoCodec::Avc);
    assert_eq!(ports.bitrate.map(|b| b.target_bps.get()), Some(1_000_000));
    assert_eq!((ports.output.width, ports.output.height), (1920, 1080));
    assert_eq!(encoder.intra_period(), 10);
}

#[test]
fn parameters_are_set_in_order() {
    init_test_tracing();
    let mut encoder = FaultyEncoder::new(component(&[8]));
    negotiate(&mut encoder, &request(640, 480)).unwrap();
    assert_eq!(
        encoder.calls(),
        [
            "port_definition(200)",
            "set_port_definition(200)",
            "port_definition(200)",
            "set_compression_format",
            "set_bitrate",
            "bitrate",
            "set_intra_period",
            "port_definition(201)"
        ]
    );
}

#[test]
fn bitrate_read_back_failure_is_not_fatal() {
    init_test_tracing();
    let mut encoder = FaultyEncoder::new(component(&[8])).failing("bitrate");
    let ports = negotiate(&mut encoder, &request(640, 480)).unwrap();
    assert_eq!(ports.bitrate, None);
    assert_eq!(ports.codec, VideoCodec::Avc);
}

#[test]
fn rejected_gop_is_fatal() {
    init_test_tracing();
    let mut encoder = FaultyEncoder::new(component(&[8])).failing("set_intra_period");
    let err = negotiate(&mut encoder, &request(640, 480)).unwrap_err();
    assert!(matches!(
        err,
        NegotiationError::Rejected {
            param: Param::IntraPeriod,
            port: 201,
            ..
        }
    ));
}

#[test]
fn accepted_geometry_must_match_request() {
    init_test_tracing();
    let mut encoder = FaultyEncoder::new(component(&[8]));
    encoder.tamper = Some(widen_stride);
    let err = negotiate(&mut encoder, &request(640, 480)).unwrap_err();
    match err {
        NegotiationError::Mismatch {
            port,
            field,
            requested,
            accepted,
        } => {
            assert_eq!((port, field), (200, "stride"));
            assert_eq!((requested, accepted), (640, 672));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn small_input_buffers_are_refused() {
    init_test_tracing();
    let mut encoder = FaultyEncoder::new(component(&[8]));
    encoder.tamper = Some(shrink_buffers);
    let err = negotiate(&mut encoder, &request(640, 480)).unwrap_err();
    assert!(matches!(
        err,
        NegotiationError::BufferTooSmall {
            port: 200,
            size: 1024,
            required: 460_800
        }
    ));
}

#[test]
fn odd_frame_size_is_refused_before_any_call() {
    init_test_tracing();
    let mut encoder = FaultyEncoder::new(component(&[8]));
    let err = negotiate(&mut encoder, &request(641, 480)).unwrap_err();
    assert!(matches!(err, NegotiationError::InvalidRequest(_)));
    assert!(encoder.calls().is_empty());
}

#[test]
fn oversized_frame_is_refused_before_any_call() {
    init_test_tracing();
    let mut encoder = FaultyEncoder::new(component(&[8]));
    let err = negotiate(&mut encoder, &request(640, 4_294_967_294)).unwrap_err();
    assert!(matches!(err, NegotiationError::InvalidRequest(_)));
    assert!(encoder.calls().is_empty());
}
