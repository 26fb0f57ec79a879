pub mod capture;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::num::NonZeroU32;
use std::path::PathBuf;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::encoder::negotiate::NegotiationRequest;
use crate::encoder::{PortPair, INPUT_PORT, MAX_DIMENSION, OUTPUT_PORT};
use crate::error::ConfigError;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub stream: StreamConfig,
    pub encoder: EncoderConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Bus session the encoded frames are published to.
    pub session: u16,
    /// Name of the shared memory area carrying I420 frames.
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Sender stamp attached to every published frame.
    pub instance_id: u32,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub component: String,
    pub input_port: u32,
    pub output_port: u32,
    pub bitrate: u32,   // bits per second, variable rate target
    pub frame_rate: u32,
    pub gop: u32,       // frames between key frames
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub channel_capacity: usize,
    #[serde(default)]
    pub pin_core: Option<usize>,
    /// Elementary stream destination, stdout when unset.
    #[serde(default)]
    pub output: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream: StreamConfig {
                session: 111,
                name: String::new(),
                width: 640,
                height: 480,
                instance_id: 0,
                verbose: false,
            },
            encoder: EncoderConfig {
                component: "video_encode".into(),
                input_port: INPUT_PORT,
                output_port: OUTPUT_PORT,
                bitrate: 1_000_000,
                frame_rate: 30,
                gop: 10,
            },
            pipeline: PipelineConfig {
                channel_capacity: 8,
                pin_core: None,
                output: None,
            },
        }
    }
}

impl Config {
    /// Reject settings the encoder could never accept.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let stream = &self.stream;
        if stream.name.trim().is_empty() {
            return Err(ConfigError::Invalid("shared memory name is required".into()));
        }
        if stream.width == 0 || stream.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame size {}x{} must be non-zero",
                stream.width, stream.height
            )));
        }
        if stream.width > MAX_DIMENSION || stream.height > MAX_DIMENSION {
            return Err(ConfigError::Invalid(format!(
                "frame size {}x{} exceeds {} pixels per side",
                stream.width, stream.height, MAX_DIMENSION
            )));
        }
        // 4:2:0 chroma planes need even dimensions
        if stream.width % 2 != 0 || stream.height % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "frame size {}x{} must be even in both dimensions",
                stream.width, stream.height
            )));
        }
        if self.encoder.bitrate == 0 {
            return Err(ConfigError::Invalid("bitrate must be greater than zero".into()));
        }
        if self.encoder.frame_rate == 0 || self.encoder.frame_rate > u16::MAX as u32 {
            return Err(ConfigError::Invalid(format!(
                "frame rate {} is out of range",
                self.encoder.frame_rate
            )));
        }
        if self.encoder.gop == 0 {
            return Err(ConfigError::Invalid("gop length must be at least 1".into()));
        }
        if self.encoder.input_port == self.encoder.output_port {
            return Err(ConfigError::Invalid(format!(
                "input and output port are both {}",
                self.encoder.input_port
            )));
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn negotiation_request(&self) -> Result<NegotiationRequest, ConfigError> {
        self.validate()?;
        let bitrate = NonZeroU32::new(self.encoder.bitrate)
            .ok_or_else(|| ConfigError::Invalid("bitrate must be greater than zero".into()))?;
        Ok(NegotiationRequest {
            width: self.stream.width,
            height: self.stream.height,
            frame_rate: self.encoder.frame_rate,
            bitrate,
            gop: self.encoder.gop,
            ports: PortPair {
                input: self.encoder.input_port,
                output: self.encoder.output_port,
            },
        })
    }
}

/// Counters collected by the frame pump over one run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PumpStats {
    pub iterations: u64,
    pub published: u64,
    pub dropped_frames: u64, // no input buffer available
    pub empty_outputs: u64,  // no output buffer, or nothing in it
    pub transient_errors: u64,
    pub payload_bytes: u64,
}
