//! Test doubles for the frame source, the bus and the encoder component.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::num::NonZeroU32;
use std::rc::Rc;
use std::time::SystemTime;

use h264_pump::capture::{FrameLayout, PixelSource};
use h264_pump::encoder::{
    negotiate, BitrateSetting, ComponentState, Compressor, EncoderBackend, Lifecycle,
    NegotiatedPorts, NegotiationRequest, PortDefinition, PortGeometry, PortPair, SoftComponent,
    VideoCodec,
};
use h264_pump::error::{EncoderError, SourceError};
use h264_pump::pipeline::{EncodedFrame, Publisher};

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "h264_pump=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn request(width: u32, height: u32) -> NegotiationRequest {
    NegotiationRequest {
        width,
        height,
        frame_rate: 30,
        bitrate: NonZeroU32::new(1_000_000).unwrap(),
        gop: 10,
        ports: PortPair::default(),
    }
}

/// Frame with every byte numbered so misplaced rows show up
pub fn numbered_frame(layout: FrameLayout, seed: u8) -> Vec<u8> {
    (0..layout.frame_len())
        .map(|i| (i % 251) as u8 ^ seed)
        .collect()
}

/// Serves a fixed list of frames, one per wait, then reports itself invalid.
pub struct MemorySource {
    frames: Vec<Vec<u8>>,
    cursor: Cell<usize>,
    pub locks: Cell<usize>,
    pub unlocks: Cell<usize>,
    /// Makes every lock attempt fail
    pub refuse_lock: Cell<bool>,
}

impl MemorySource {
    pub fn new(frames: Vec<Vec<u8>>) -> Self {
        Self {
            frames,
            cursor: Cell::new(0),
            locks: Cell::new(0),
            unlocks: Cell::new(0),
            refuse_lock: Cell::new(false),
        }
    }

    pub fn numbered(layout: FrameLayout, count: usize) -> Self {
        Self::new(
            (0..count)
                .map(|n| numbered_frame(layout, n as u8))
                .collect(),
        )
    }

    pub fn frame(&self, index: usize) -> &[u8] {
        &self.frames[index]
    }

    pub fn waits(&self) -> usize {
        self.cursor.get()
    }
}

impl PixelSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn size(&self) -> usize {
        self.frames.first().map_or(0, Vec::len)
    }

    fn is_valid(&self) -> bool {
        self.cursor.get() < self.frames.len()
    }

    fn wait(&self) {
        self.cursor.set(self.cursor.get() + 1);
    }

    fn lock(&self) -> Result<(), SourceError> {
        if self.refuse_lock.get() {
            return Err(SourceError::Lock {
                name: "memory".into(),
                source: nix::errno::Errno::EINVAL,
            });
        }
        self.locks.set(self.locks.get() + 1);
        Ok(())
    }

    fn unlock(&self) {
        self.unlocks.set(self.unlocks.get() + 1);
    }

    fn region(&self) -> &[u8] {
        match self.cursor.get().checked_sub(1) {
            Some(index) => self.frames.get(index).map_or(&[][..], Vec::as_slice),
            None => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub fourcc: &'static str,
    pub width: u32,
    pub height: u32,
    pub payload: Vec<u8>,
    pub sender_stamp: u32,
}

/// Keeps everything sent; stops running after `stop_after` frames.
#[derive(Default)]
pub struct RecordingPublisher {
    pub sent: RefCell<Vec<Sent>>,
    pub stop_after: Option<usize>,
}

impl RecordingPublisher {
    pub fn stopping_after(frames: usize) -> Self {
        Self {
            sent: RefCell::default(),
            stop_after: Some(frames),
        }
    }
}

impl Publisher for RecordingPublisher {
    fn send(&self, frame: &EncodedFrame<'_>, _sample_time: SystemTime, sender_stamp: u32) {
        self.sent.borrow_mut().push(Sent {
            fourcc: frame.fourcc,
            width: frame.width,
            height: frame.height,
            payload: frame.payload.to_vec(),
            sender_stamp,
        });
    }

    fn is_running(&self) -> bool {
        self.stop_after
            .map_or(true, |limit| self.sent.borrow().len() < limit)
    }
}

/// Writes the first bytes of every frame, as many as the script says.
/// The last scripted length repeats.
pub struct ScriptedCompressor {
    lengths: VecDeque<usize>,
    pub frames: Vec<Vec<u8>>,
    pub configured: Option<(PortGeometry, u32, u32)>,
}

impl ScriptedCompressor {
    pub fn new(lengths: &[usize]) -> Self {
        Self {
            lengths: lengths.iter().copied().collect(),
            frames: Vec::new(),
            configured: None,
        }
    }
}

impl Compressor for ScriptedCompressor {
    fn configure(
        &mut self,
        input: &PortGeometry,
        bitrate: &BitrateSetting,
        intra_period: u32,
    ) -> Result<(), EncoderError> {
        self.configured = Some((*input, bitrate.target_bps.get(), intra_period));
        Ok(())
    }

    fn compress(&mut self, frame: &[u8], out: &mut [u8]) -> Result<usize, EncoderError> {
        self.frames.push(frame.to_vec());
        let wanted = if self.lengths.len() > 1 {
            self.lengths.pop_front().unwrap_or(0)
        } else {
            self.lengths.front().copied().unwrap_or(0)
        };
        let len = wanted.min(out.len());
        for (i, byte) in out[..len].iter_mut().enumerate() {
            *byte = frame.get(i).copied().unwrap_or(0xAB);
        }
        Ok(len)
    }
}

pub type TestComponent = SoftComponent<ScriptedCompressor>;

pub fn component(lengths: &[usize]) -> TestComponent {
    SoftComponent::new("video_encode", ScriptedCompressor::new(lengths))
}

/// Negotiated and executing component, ready for the frame pump
pub fn executing<E: EncoderBackend>(
    encoder: E,
    width: u32,
    height: u32,
) -> (Lifecycle<E>, NegotiatedPorts) {
    let mut lifecycle = Lifecycle::new(encoder, PortPair::default());
    let ports = negotiate(lifecycle.encoder_mut(), &request(width, height)).unwrap();
    lifecycle.bring_up().unwrap();
    (lifecycle, ports)
}

/// Wraps a component, logging every call and failing the ones asked for.
///
/// Calls are named like `change_state(idle)` or `enable_port_buffers(201)`.
/// Failed submits still hand the buffer on so the pool does not drain.
pub struct FaultyEncoder<E> {
    pub inner: E,
    pub calls: Rc<RefCell<Vec<String>>>,
    pub failing: HashSet<String>,
    pub starve_input: bool,
    pub starve_output: bool,
    pub tamper: Option<fn(&mut PortDefinition)>,
}

impl<E: EncoderBackend> FaultyEncoder<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            calls: Rc::default(),
            failing: HashSet::new(),
            starve_input: false,
            starve_output: false,
            tamper: None,
        }
    }

    pub fn failing(mut self, call: &str) -> Self {
        self.failing.insert(call.to_owned());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn record(&self, call: String) -> Result<(), EncoderError> {
        let fail = self.failing.contains(&call);
        self.calls.borrow_mut().push(call.clone());
        if fail {
            Err(EncoderError::InsufficientResources(format!("injected {call}")))
        } else {
            Ok(())
        }
    }
}

impl<E: EncoderBackend> EncoderBackend for FaultyEncoder<E> {
    type Buffer = E::Buffer;

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn port_definition(&self, port: u32) -> Result<PortDefinition, EncoderError> {
        self.record(format!("port_definition({port})"))?;
        let mut definition = self.inner.port_definition(port)?;
        if let Some(tamper) = self.tamper {
            tamper(&mut definition);
        }
        Ok(definition)
    }

    fn set_port_definition(&mut self, definition: &PortDefinition) -> Result<(), EncoderError> {
        self.record(format!("set_port_definition({})", definition.geometry.port))?;
        self.inner.set_port_definition(definition)
    }

    fn set_compression_format(&mut self, port: u32, codec: VideoCodec) -> Result<(), EncoderError> {
        self.record("set_compression_format".into())?;
        self.inner.set_compression_format(port, codec)
    }

    fn bitrate(&self, port: u32) -> Result<BitrateSetting, EncoderError> {
        self.record("bitrate".into())?;
        self.inner.bitrate(port)
    }

    fn set_bitrate(&mut self, setting: &BitrateSetting) -> Result<(), EncoderError> {
        self.record("set_bitrate".into())?;
        self.inner.set_bitrate(setting)
    }

    fn set_intra_period(&mut self, port: u32, frames: u32) -> Result<(), EncoderError> {
        self.record("set_intra_period".into())?;
        self.inner.set_intra_period(port, frames)
    }

    fn change_state(&mut self, target: ComponentState) -> Result<(), EncoderError> {
        self.record(format!("change_state({target})"))?;
        self.inner.change_state(target)
    }

    fn enable_port_buffers(&mut self, port: u32) -> Result<(), EncoderError> {
        self.record(format!("enable_port_buffers({port})"))?;
        self.inner.enable_port_buffers(port)
    }

    fn disable_port_buffers(&mut self, port: u32) -> Result<(), EncoderError> {
        self.record(format!("disable_port_buffers({port})"))?;
        self.inner.disable_port_buffers(port)
    }

    fn acquire_input_buffer(&mut self, port: u32) -> Option<Self::Buffer> {
        let _ = self.record("acquire_input_buffer".into());
        if self.starve_input {
            return None;
        }
        self.inner.acquire_input_buffer(port)
    }

    fn submit_input_buffer(&mut self, buffer: Self::Buffer) -> Result<(), EncoderError> {
        let injected = self.record("submit_input_buffer".into());
        self.inner.submit_input_buffer(buffer)?;
        injected
    }

    fn acquire_output_buffer(&mut self, port: u32) -> Option<Self::Buffer> {
        let _ = self.record("acquire_output_buffer".into());
        if self.starve_output {
            return None;
        }
        self.inner.acquire_output_buffer(port)
    }

    fn resubmit_output_buffer(&mut self, buffer: Self::Buffer) -> Result<(), EncoderError> {
        let injected = self.record("resubmit_output_buffer".into());
        self.inner.resubmit_output_buffer(buffer)?;
        injected
    }

    fn release(&mut self) -> Result<(), EncoderError> {
        self.record("release".into())?;
        self.inner.release()
    }
}
