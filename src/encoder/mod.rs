//! Encoder component interface
//!
//! The component is a stateful block with one raw input port and one
//! compressed output port. Parameters are set per port, the component moves
//! through Loaded/Idle/Executing, and buffers travel back and forth by value:
//! whoever holds an [`EncoderBuffer`] owns it until it is submitted back.

pub mod lifecycle;
pub mod negotiate;
#[cfg(feature = "openh264")]
pub mod openh264;
pub mod platform;
pub mod soft;

use std::fmt;
use std::num::NonZeroU32;

use crate::error::EncoderError;

pub use lifecycle::Lifecycle;
pub use negotiate::{negotiate, NegotiatedPorts, NegotiationRequest};
#[cfg(feature = "openh264")]
pub use self::openh264::OpenH264Compressor;
pub use platform::{Platform, PlatformGuard};
pub use soft::{Compressor, SoftComponent, SoftPlatform};

pub const INPUT_PORT: u32 = 200;
pub const OUTPUT_PORT: u32 = 201;

/// Row and slice alignment the encoder requires
pub const ALIGNMENT: u32 = 16;

/// Largest width or height accepted. Keeps aligned sizes and frame
/// capacities well inside `u32`.
pub const MAX_DIMENSION: u32 = 16_384;

pub fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub input: u32,
    pub output: u32,
}

impl Default for PortPair {
    fn default() -> Self {
        Self {
            input: INPUT_PORT,
            output: OUTPUT_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    Unused,
    Yuv420PackedPlanar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Unused,
    Avc,
}

impl VideoCodec {
    pub fn fourcc(&self) -> Option<&'static str> {
        match self {
            VideoCodec::Avc => Some("h264"),
            VideoCodec::Unused => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Loaded,
    Idle,
    Executing,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentState::Loaded => "loaded",
            ComponentState::Idle => "idle",
            ComponentState::Executing => "executing",
        };
        f.write_str(name)
    }
}

/// Video geometry of one port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortGeometry {
    pub port: u32,
    pub direction: Direction,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub slice_height: u32,
    pub color_format: ColorFormat,
    pub frame_rate_q16: u32,
}

impl PortGeometry {
    /// Packed planar 4:2:0 input geometry. Stride and slice height are always
    /// derived from the frame size, never taken from a previous read.
    pub fn planar_420(port: u32, width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            port,
            direction: Direction::Input,
            width,
            height,
            stride: width,
            slice_height: align_up(height, ALIGNMENT),
            color_format: ColorFormat::Yuv420PackedPlanar,
            frame_rate_q16: frame_rate << 16,
        }
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate_q16 >> 16
    }

    /// Bytes between the start of the Y plane and the start of the U plane
    pub fn luma_len(&self) -> usize {
        self.stride as usize * self.slice_height as usize
    }

    pub fn chroma_stride(&self) -> usize {
        (self.stride >> 1) as usize
    }

    pub fn chroma_len(&self) -> usize {
        self.chroma_stride() * (self.slice_height >> 1) as usize
    }

    pub fn u_offset(&self) -> usize {
        self.luma_len()
    }

    pub fn v_offset(&self) -> usize {
        self.luma_len() + self.chroma_len()
    }

    /// Bytes a buffer needs to hold one padded frame
    pub fn frame_capacity(&self) -> usize {
        self.luma_len() + 2 * self.chroma_len()
    }
}

/// Full port definition as reported by the component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDefinition {
    pub geometry: PortGeometry,
    pub compression: VideoCodec,
    pub buffer_count_actual: u32,
    pub buffer_count_min: u32,
    pub buffer_size: usize,
    pub buffer_alignment: u32,
    pub enabled: bool,
    pub populated: bool,
}

impl fmt::Display for PortDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = &self.geometry;
        write!(
            f,
            "Port {}: {} {}/{} {} {} {},{} {}x{} {}x{} @{} {:?}/{:?}",
            g.port,
            match g.direction {
                Direction::Input => "in",
                Direction::Output => "out",
            },
            self.buffer_count_actual,
            self.buffer_count_min,
            self.buffer_size,
            self.buffer_alignment,
            if self.enabled { "enabled" } else { "disabled" },
            if self.populated { "populated" } else { "not pop." },
            g.width,
            g.height,
            g.stride,
            g.slice_height,
            g.frame_rate_q16,
            g.color_format,
            self.compression,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRate {
    Variable,
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateSetting {
    pub port: u32,
    pub control: ControlRate,
    pub target_bps: NonZeroU32,
}

impl BitrateSetting {
    pub fn variable(port: u32, target_bps: NonZeroU32) -> Self {
        Self {
            port,
            control: ControlRate::Variable,
            target_bps,
        }
    }
}

/// A buffer lent out by the component
pub trait EncoderBuffer {
    fn capacity(&self) -> usize;

    /// The whole allocation, for writing raw frames.
    fn as_mut_slice(&mut self) -> &mut [u8];

    /// The filled part of the buffer.
    fn filled(&self) -> &[u8];

    fn filled_len(&self) -> usize;

    fn set_filled_len(&mut self, len: usize);
}

/// Narrow interface to the encoder component
///
/// Buffer acquisition never blocks: `None` means nothing is available right
/// now. Submitting a buffer hands ownership back to the component even when
/// the call reports an error.
pub trait EncoderBackend {
    type Buffer: EncoderBuffer;

    fn name(&self) -> &str;

    fn port_definition(&self, port: u32) -> Result<PortDefinition, EncoderError>;

    fn set_port_definition(&mut self, definition: &PortDefinition) -> Result<(), EncoderError>;

    fn set_compression_format(&mut self, port: u32, codec: VideoCodec) -> Result<(), EncoderError>;

    fn bitrate(&self, port: u32) -> Result<BitrateSetting, EncoderError>;

    fn set_bitrate(&mut self, setting: &BitrateSetting) -> Result<(), EncoderError>;

    /// Frames between key frames.
    fn set_intra_period(&mut self, port: u32, frames: u32) -> Result<(), EncoderError>;

    fn change_state(&mut self, target: ComponentState) -> Result<(), EncoderError>;

    fn enable_port_buffers(&mut self, port: u32) -> Result<(), EncoderError>;

    fn disable_port_buffers(&mut self, port: u32) -> Result<(), EncoderError>;

    fn acquire_input_buffer(&mut self, port: u32) -> Option<Self::Buffer>;

    fn submit_input_buffer(&mut self, buffer: Self::Buffer) -> Result<(), EncoderError>;

    fn acquire_output_buffer(&mut self, port: u32) -> Option<Self::Buffer>;

    fn resubmit_output_buffer(&mut self, buffer: Self::Buffer) -> Result<(), EncoderError>;

    /// Destroy the component. Every later call fails with `Released`.
    fn release(&mut self) -> Result<(), EncoderError>;
}
