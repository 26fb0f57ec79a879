//! In-process encoder component
//!
//! Behaves like the hardware block it stands in for: ports must be
//! configured while Loaded, buffer pools exist only between enable and
//! disable, Executing needs both pools populated, and every buffer handed out
//! has to come back through the matching submit call before it can be reused.
//! The actual compression is delegated to a [`Compressor`].

use std::collections::VecDeque;
use std::num::NonZeroU32;

use tracing::{debug, info};

use crate::encoder::platform::Platform;
use crate::encoder::{
    align_up, BitrateSetting, ColorFormat, ComponentState, Direction, EncoderBackend,
    EncoderBuffer, PortDefinition, PortGeometry, VideoCodec, ALIGNMENT, INPUT_PORT, MAX_DIMENSION,
    OUTPUT_PORT,
};
use crate::error::{EncoderError, PlatformError};

/// Smallest output buffer the component hands out
pub const MIN_OUTPUT_BUFFER: usize = 16 * 1024;

const DEFAULT_BITRATE: NonZeroU32 = match NonZeroU32::new(10_000_000) {
    Some(bps) => bps,
    None => unreachable!(),
};

/// Turns one padded planar frame into compressed bytes
pub trait Compressor {
    /// Called when the component enters Executing.
    fn configure(
        &mut self,
        input: &PortGeometry,
        bitrate: &BitrateSetting,
        intra_period: u32,
    ) -> Result<(), EncoderError>;

    /// Compress `frame` into `out` and return the number of bytes written.
    /// Zero is a valid answer: the frame produced no output.
    fn compress(&mut self, frame: &[u8], out: &mut [u8]) -> Result<usize, EncoderError>;
}

#[derive(Debug)]
pub struct SoftBuffer {
    id: u64,
    port: u32,
    data: Box<[u8]>,
    filled: usize,
}

impl SoftBuffer {
    pub fn port(&self) -> u32 {
        self.port
    }
}

impl EncoderBuffer for SoftBuffer {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    fn filled_len(&self) -> usize {
        self.filled
    }

    fn set_filled_len(&mut self, len: usize) {
        self.filled = len.min(self.data.len());
    }
}

struct PortSlot {
    definition: PortDefinition,
    /// Input: free for the client. Output: queued for filling.
    idle: VecDeque<SoftBuffer>,
    /// Output only: filled and waiting for the client.
    ready: VecDeque<SoftBuffer>,
    lent: Vec<u64>,
}

impl PortSlot {
    fn new(definition: PortDefinition) -> Self {
        Self {
            definition,
            idle: VecDeque::new(),
            ready: VecDeque::new(),
            lent: Vec::new(),
        }
    }

    fn port(&self) -> u32 {
        self.definition.geometry.port
    }

    fn lend(&mut self, buffer: SoftBuffer) -> SoftBuffer {
        self.lent.push(buffer.id);
        buffer
    }

    fn take_back(&mut self, buffer: &SoftBuffer) -> Result<(), EncoderError> {
        match self.lent.iter().position(|id| *id == buffer.id) {
            Some(index) => {
                self.lent.swap_remove(index);
                Ok(())
            }
            None => Err(EncoderError::BufferNotOwned(self.port())),
        }
    }

    fn free_all(&mut self) {
        self.idle.clear();
        self.ready.clear();
        self.lent.clear();
        self.definition.enabled = false;
        self.definition.populated = false;
    }
}

pub struct SoftComponent<C> {
    name: String,
    state: ComponentState,
    input: PortSlot,
    output: PortSlot,
    /// Submitted inputs waiting for an output buffer
    pending: VecDeque<SoftBuffer>,
    bitrate: BitrateSetting,
    intra_period: u32,
    compressor: C,
    next_id: u64,
    frames_encoded: u64,
    released: bool,
}

impl<C: Compressor> SoftComponent<C> {
    pub fn new(name: &str, compressor: C) -> Self {
        let input = PortDefinition {
            geometry: PortGeometry::planar_420(INPUT_PORT, 320, 240, 30),
            compression: VideoCodec::Unused,
            buffer_count_actual: 1,
            buffer_count_min: 1,
            buffer_size: 115_200,
            buffer_alignment: ALIGNMENT,
            enabled: false,
            populated: false,
        };
        let output = PortDefinition {
            geometry: PortGeometry {
                port: OUTPUT_PORT,
                direction: Direction::Output,
                color_format: ColorFormat::Unused,
                frame_rate_q16: 0,
                ..input.geometry
            },
            compression: VideoCodec::Unused,
            buffer_count_actual: 1,
            buffer_count_min: 1,
            buffer_size: 65_536,
            buffer_alignment: ALIGNMENT,
            enabled: false,
            populated: false,
        };
        let bitrate = BitrateSetting::variable(OUTPUT_PORT, DEFAULT_BITRATE);
        Self {
            name: name.to_owned(),
            state: ComponentState::Loaded,
            input: PortSlot::new(input),
            output: PortSlot::new(output),
            pending: VecDeque::new(),
            bitrate,
            intra_period: 30,
            compressor,
            next_id: 0,
            frames_encoded: 0,
            released: false,
        }
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    pub fn intra_period(&self) -> u32 {
        self.intra_period
    }

    pub fn compressor(&self) -> &C {
        &self.compressor
    }

    fn alive(&self) -> Result<(), EncoderError> {
        if self.released {
            Err(EncoderError::Released)
        } else {
            Ok(())
        }
    }

    fn slot(&self, port: u32) -> Result<&PortSlot, EncoderError> {
        if port == self.input.port() {
            Ok(&self.input)
        } else if port == self.output.port() {
            Ok(&self.output)
        } else {
            Err(EncoderError::BadPort(port))
        }
    }

    fn slot_mut(&mut self, port: u32) -> Result<&mut PortSlot, EncoderError> {
        if port == self.input.port() {
            Ok(&mut self.input)
        } else if port == self.output.port() {
            Ok(&mut self.output)
        } else {
            Err(EncoderError::BadPort(port))
        }
    }

    fn require_output_port(&self, port: u32) -> Result<(), EncoderError> {
        if port == self.output.port() {
            Ok(())
        } else if port == self.input.port() {
            Err(EncoderError::UnsupportedSetting(format!(
                "port {port} is not a compressed port"
            )))
        } else {
            Err(EncoderError::BadPort(port))
        }
    }

    /// Parameters may change while Loaded or while the port is disabled.
    fn require_configurable(&self, port: u32) -> Result<(), EncoderError> {
        let slot = self.slot(port)?;
        if self.state != ComponentState::Loaded && slot.definition.enabled {
            return Err(EncoderError::IncorrectState(self.state.to_string()));
        }
        Ok(())
    }

    fn apply_input_definition(&mut self, definition: &PortDefinition) -> Result<(), EncoderError> {
        let g = definition.geometry;
        if g.width == 0 || g.height == 0 {
            return Err(EncoderError::UnsupportedSetting(format!(
                "frame size {}x{}",
                g.width, g.height
            )));
        }
        if g.stride > MAX_DIMENSION || g.slice_height > MAX_DIMENSION {
            return Err(EncoderError::UnsupportedSetting(format!(
                "stride {} / slice height {} above {}",
                g.stride, g.slice_height, MAX_DIMENSION
            )));
        }
        if g.stride < g.width || g.slice_height < g.height {
            return Err(EncoderError::UnsupportedSetting(format!(
                "stride {} / slice height {} smaller than {}x{}",
                g.stride, g.slice_height, g.width, g.height
            )));
        }
        if g.color_format != ColorFormat::Yuv420PackedPlanar {
            return Err(EncoderError::UnsupportedSetting(format!(
                "color format {:?}",
                g.color_format
            )));
        }
        if g.frame_rate_q16 == 0 {
            return Err(EncoderError::UnsupportedSetting("frame rate 0".into()));
        }

        let slot = &mut self.input.definition;
        slot.geometry = PortGeometry {
            port: slot.geometry.port,
            direction: Direction::Input,
            ..g
        };
        slot.buffer_count_actual = definition.buffer_count_actual.max(slot.buffer_count_min);
        slot.buffer_size = align_up(g.frame_capacity() as u32, slot.buffer_alignment) as usize;

        // The compressed port follows the raw frame size.
        let out = &mut self.output.definition;
        out.geometry.width = g.width;
        out.geometry.height = g.height;
        out.geometry.stride = g.stride;
        out.geometry.slice_height = g.slice_height;
        out.buffer_size = g.luma_len().max(MIN_OUTPUT_BUFFER);
        Ok(())
    }

    fn allocate(&mut self, port: u32) -> Result<(), EncoderError> {
        let mut next_id = self.next_id;
        let slot = self.slot_mut(port)?;
        if slot.definition.enabled {
            return Err(EncoderError::PortEnabled(port));
        }
        for _ in 0..slot.definition.buffer_count_actual {
            slot.idle.push_back(SoftBuffer {
                id: next_id,
                port,
                data: vec![0u8; slot.definition.buffer_size].into_boxed_slice(),
                filled: 0,
            });
            next_id += 1;
        }
        slot.definition.enabled = true;
        slot.definition.populated = true;
        debug!(
            "Allocated {} x {} bytes for port {}",
            slot.definition.buffer_count_actual, slot.definition.buffer_size, port
        );
        self.next_id = next_id;
        Ok(())
    }

    /// Pair pending inputs with output buffers waiting to be filled.
    fn process(&mut self) -> Result<(), EncoderError> {
        while !self.output.idle.is_empty() {
            let Some(mut input) = self.pending.pop_front() else {
                break;
            };
            if input.filled == 0 {
                self.input.idle.push_back(input);
                continue;
            }
            let Some(mut output) = self.output.idle.pop_front() else {
                self.pending.push_front(input);
                break;
            };

            // Planes are read per the port geometry; filled_len only marks
            // the buffer as carrying a frame.
            let frame_len = self
                .input
                .definition
                .geometry
                .frame_capacity()
                .min(input.data.len());
            let result = self
                .compressor
                .compress(&input.data[..frame_len], &mut output.data);
            input.filled = 0;
            self.input.idle.push_back(input);

            match result {
                Ok(written) => {
                    output.filled = written.min(output.data.len());
                    self.frames_encoded += 1;
                    self.output.ready.push_back(output);
                }
                Err(e) => {
                    self.output.idle.push_front(output);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Leaving Executing returns everything in flight to the idle queues.
    fn flush(&mut self) {
        while let Some(mut buffer) = self.pending.pop_front() {
            buffer.filled = 0;
            self.input.idle.push_back(buffer);
        }
        while let Some(mut buffer) = self.output.ready.pop_front() {
            buffer.filled = 0;
            self.output.idle.push_back(buffer);
        }
    }
}

impl<C: Compressor> EncoderBackend for SoftComponent<C> {
    type Buffer = SoftBuffer;

    fn name(&self) -> &str {
        &self.name
    }

    fn port_definition(&self, port: u32) -> Result<PortDefinition, EncoderError> {
        self.alive()?;
        Ok(self.slot(port)?.definition.clone())
    }

    fn set_port_definition(&mut self, definition: &PortDefinition) -> Result<(), EncoderError> {
        self.alive()?;
        let port = definition.geometry.port;
        self.require_configurable(port)?;
        if port == self.input.port() {
            self.apply_input_definition(definition)
        } else {
            let slot = self.slot_mut(port)?;
            slot.definition.buffer_count_actual = definition
                .buffer_count_actual
                .max(slot.definition.buffer_count_min);
            Ok(())
        }
    }

    fn set_compression_format(&mut self, port: u32, codec: VideoCodec) -> Result<(), EncoderError> {
        self.alive()?;
        self.require_output_port(port)?;
        self.require_configurable(port)?;
        if codec != VideoCodec::Avc {
            return Err(EncoderError::UnsupportedSetting(format!("codec {codec:?}")));
        }
        self.output.definition.compression = codec;
        Ok(())
    }

    fn bitrate(&self, port: u32) -> Result<BitrateSetting, EncoderError> {
        self.alive()?;
        self.require_output_port(port)?;
        Ok(self.bitrate)
    }

    fn set_bitrate(&mut self, setting: &BitrateSetting) -> Result<(), EncoderError> {
        self.alive()?;
        self.require_output_port(setting.port)?;
        self.bitrate = *setting;
        Ok(())
    }

    fn set_intra_period(&mut self, port: u32, frames: u32) -> Result<(), EncoderError> {
        self.alive()?;
        self.require_output_port(port)?;
        if frames == 0 {
            return Err(EncoderError::UnsupportedSetting("intra period 0".into()));
        }
        self.intra_period = frames;
        Ok(())
    }

    fn change_state(&mut self, target: ComponentState) -> Result<(), EncoderError> {
        self.alive()?;
        match (self.state, target) {
            (current, target) if current == target => {
                return Err(EncoderError::SameState(current.to_string()));
            }
            (ComponentState::Loaded, ComponentState::Idle) => {}
            (ComponentState::Idle, ComponentState::Executing) => {
                for slot in [&self.input, &self.output] {
                    if !slot.definition.populated {
                        return Err(EncoderError::InsufficientResources(format!(
                            "port {} has no buffers",
                            slot.port()
                        )));
                    }
                }
                self.compressor
                    .configure(&self.input.definition.geometry, &self.bitrate, self.intra_period)?;
            }
            (ComponentState::Executing, ComponentState::Idle) => self.flush(),
            (ComponentState::Idle, ComponentState::Loaded) => {
                if self.input.definition.enabled || self.output.definition.enabled {
                    return Err(EncoderError::IncorrectState(
                        "buffers still allocated".into(),
                    ));
                }
            }
            (from, to) => {
                return Err(EncoderError::IncorrectStateTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
        }
        debug!("{}: {} -> {}", self.name, self.state, target);
        self.state = target;
        Ok(())
    }

    fn enable_port_buffers(&mut self, port: u32) -> Result<(), EncoderError> {
        self.alive()?;
        if self.state != ComponentState::Idle {
            return Err(EncoderError::IncorrectState(self.state.to_string()));
        }
        self.allocate(port)
    }

    fn disable_port_buffers(&mut self, port: u32) -> Result<(), EncoderError> {
        self.alive()?;
        let is_input = port == self.input.port();
        let slot = self.slot_mut(port)?;
        if !slot.definition.enabled {
            return Err(EncoderError::PortDisabled(port));
        }
        slot.free_all();
        if is_input {
            self.pending.clear();
        }
        debug!("Freed buffers for port {}", port);
        Ok(())
    }

    fn acquire_input_buffer(&mut self, port: u32) -> Option<SoftBuffer> {
        if self.released || port != self.input.port() || !self.input.definition.enabled {
            return None;
        }
        if self.state == ComponentState::Loaded {
            return None;
        }
        let buffer = self.input.idle.pop_front()?;
        Some(self.input.lend(buffer))
    }

    fn submit_input_buffer(&mut self, mut buffer: SoftBuffer) -> Result<(), EncoderError> {
        self.alive()?;
        if buffer.port != self.input.port() {
            return Err(EncoderError::BadPort(buffer.port));
        }
        self.input.take_back(&buffer)?;
        if self.state != ComponentState::Executing {
            buffer.filled = 0;
            self.input.idle.push_back(buffer);
            return Err(EncoderError::IncorrectState(self.state.to_string()));
        }
        self.pending.push_back(buffer);
        self.process()
    }

    fn acquire_output_buffer(&mut self, port: u32) -> Option<SoftBuffer> {
        if self.released || port != self.output.port() || !self.output.definition.enabled {
            return None;
        }
        let buffer = self.output.ready.pop_front()?;
        Some(self.output.lend(buffer))
    }

    fn resubmit_output_buffer(&mut self, mut buffer: SoftBuffer) -> Result<(), EncoderError> {
        self.alive()?;
        if buffer.port != self.output.port() {
            return Err(EncoderError::BadPort(buffer.port));
        }
        self.output.take_back(&buffer)?;
        buffer.filled = 0;
        self.output.idle.push_back(buffer);
        if self.state == ComponentState::Executing {
            self.process()?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), EncoderError> {
        self.alive()?;
        self.pending.clear();
        self.input.free_all();
        self.output.free_all();
        self.released = true;
        info!("Released component '{}' after {} frames", self.name, self.frames_encoded);
        Ok(())
    }
}

/// Platform that creates [`SoftComponent`]s with a fresh compressor each
pub struct SoftPlatform<F> {
    make_compressor: F,
}

impl<F> SoftPlatform<F> {
    pub fn new(make_compressor: F) -> Self {
        Self { make_compressor }
    }
}

impl<F, C> Platform for SoftPlatform<F>
where
    F: FnMut() -> C,
    C: Compressor,
{
    type Encoder = SoftComponent<C>;

    fn host_init(&mut self) {
        debug!("host init");
    }

    fn client_init(&mut self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn core_init(&mut self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn create_encoder(&mut self, name: &str) -> Result<Self::Encoder, PlatformError> {
        if name != "video_encode" {
            return Err(PlatformError::ComponentCreate {
                name: name.to_owned(),
                reason: "unknown component".into(),
            });
        }
        Ok(SoftComponent::new(name, (self.make_compressor)()))
    }

    fn core_deinit(&mut self) {}

    fn client_destroy(&mut self) {}

    fn host_deinit(&mut self) {
        debug!("host deinit");
    }
}
