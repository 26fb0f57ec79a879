//! Port format negotiation

use std::num::NonZeroU32;

use tracing::{info, instrument, warn};

use crate::encoder::{
    BitrateSetting, EncoderBackend, PortGeometry, PortPair, VideoCodec, MAX_DIMENSION,
};
use crate::error::{NegotiationError, Param};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationRequest {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate: NonZeroU32,
    pub gop: u32,
    pub ports: PortPair,
}

/// What the component accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedPorts {
    pub input: PortGeometry,
    pub output: PortGeometry,
    pub input_buffer_size: usize,
    pub codec: VideoCodec,
    /// Bitrate as read back, when the component reported it
    pub bitrate: Option<BitrateSetting>,
}

/// Configure input geometry, output codec, bitrate and GOP on the component.
#[instrument(skip(encoder), fields(component = encoder.name()))]
pub fn negotiate<E>(
    encoder: &mut E,
    request: &NegotiationRequest,
) -> Result<NegotiatedPorts, NegotiationError>
where
    E: EncoderBackend + ?Sized,
{
    let NegotiationRequest {
        width,
        height,
        frame_rate,
        bitrate,
        gop,
        ports,
    } = *request;

    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(NegotiationError::InvalidRequest(format!(
            "{width}x{height} is not a valid 4:2:0 frame size"
        )));
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(NegotiationError::InvalidRequest(format!(
            "{width}x{height} exceeds {MAX_DIMENSION} pixels per side"
        )));
    }
    if frame_rate == 0 || frame_rate > u16::MAX as u32 {
        return Err(NegotiationError::InvalidRequest(format!(
            "frame rate {frame_rate} does not fit Q16"
        )));
    }
    if gop == 0 {
        return Err(NegotiationError::InvalidRequest("gop length must be at least 1".into()));
    }

    let rejected = |param, port| move |source| NegotiationError::Rejected { param, port, source };

    let mut definition = encoder
        .port_definition(ports.input)
        .map_err(rejected(Param::PortDefinition, ports.input))?;
    info!("{}", definition);

    let wanted = PortGeometry::planar_420(ports.input, width, height, frame_rate);
    definition.geometry = wanted;
    info!("{}", definition);

    encoder
        .set_port_definition(&definition)
        .map_err(rejected(Param::PortDefinition, ports.input))?;

    let accepted = encoder
        .port_definition(ports.input)
        .map_err(rejected(Param::PortDefinition, ports.input))?;
    verify_geometry(&wanted, &accepted.geometry)?;
    let required = wanted.frame_capacity();
    if accepted.buffer_size < required {
        return Err(NegotiationError::BufferTooSmall {
            port: ports.input,
            size: accepted.buffer_size,
            required,
        });
    }

    info!("Setting compression format for port {}", ports.output);
    encoder
        .set_compression_format(ports.output, VideoCodec::Avc)
        .map_err(rejected(Param::VideoPortFormat, ports.output))?;

    encoder
        .set_bitrate(&BitrateSetting::variable(ports.output, bitrate))
        .map_err(rejected(Param::Bitrate, ports.output))?;

    let bitrate = match encoder.bitrate(ports.output) {
        Ok(current) => {
            info!("Current bitrate={}", current.target_bps);
            Some(current)
        }
        Err(e) => {
            warn!("Reading back bitrate for port {} failed: {}", ports.output, e);
            None
        }
    };

    encoder
        .set_intra_period(ports.output, gop)
        .map_err(rejected(Param::IntraPeriod, ports.output))?;

    let output = encoder
        .port_definition(ports.output)
        .map_err(rejected(Param::PortDefinition, ports.output))?;
    info!("{}", output);

    Ok(NegotiatedPorts {
        input: accepted.geometry,
        output: output.geometry,
        input_buffer_size: accepted.buffer_size,
        codec: output.compression,
        bitrate,
    })
}

fn verify_geometry(wanted: &PortGeometry, accepted: &PortGeometry) -> Result<(), NegotiationError> {
    let fields = [
        ("width", wanted.width, accepted.width),
        ("height", wanted.height, accepted.height),
        ("stride", wanted.stride, accepted.stride),
        ("slice height", wanted.slice_height, accepted.slice_height),
        ("frame rate", wanted.frame_rate_q16, accepted.frame_rate_q16),
    ];
    for (field, requested, got) in fields {
        if requested != got {
            return Err(NegotiationError::Mismatch {
                port: wanted.port,
                field,
                requested,
                accepted: got,
            });
        }
    }
    if accepted.color_format != wanted.color_format {
        return Err(NegotiationError::Mismatch {
            port: wanted.port,
            field: "color format",
            requested: wanted.color_format as u32,
            accepted: accepted.color_format as u32,
        });
    }
    Ok(())
}
