//! Steady-state frame loop between the raw frame source and the encoder

use std::time::{Instant, SystemTime};

use tracing::{debug, info, warn};

use crate::capture::{FrameLayout, PixelSource, RawFrame};
use crate::encoder::{EncoderBackend, EncoderBuffer, NegotiatedPorts, PortGeometry};
use crate::error::EncoderError;
use crate::pipeline::publish::{EncodedFrame, Publisher};
use crate::PumpStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOptions {
    pub sender_stamp: u32,
    pub verbose: bool,
}

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    SourceLost,
    BusStopped,
}

/// What a single iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iteration {
    /// A raw frame went into an input buffer and was submitted
    pub fed: bool,
    /// Bytes published, zero when nothing went out
    pub published: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyError {
    pub needed: usize,
    pub capacity: usize,
}

/// Copy a raw frame into an input buffer using the port's stride and slice
/// height. Returns the end offset of the V plane.
pub fn copy_into_port_layout(
    frame: &RawFrame<'_>,
    geometry: &PortGeometry,
    dst: &mut [u8],
) -> Result<usize, CopyError> {
    let layout = frame.layout();
    let width = layout.width as usize;
    let height = layout.height as usize;
    let chroma_width = width / 2;
    let chroma_height = height / 2;

    let stride = geometry.stride as usize;
    let chroma_stride = geometry.chroma_stride();
    let end = geometry.v_offset() + chroma_stride * chroma_height;
    if end > dst.len() || stride < width || chroma_stride < chroma_width {
        return Err(CopyError {
            needed: end,
            capacity: dst.len(),
        });
    }

    copy_plane(frame.y(), width, &mut dst[..geometry.u_offset()], stride);
    copy_plane(
        frame.u(),
        chroma_width,
        &mut dst[geometry.u_offset()..geometry.v_offset()],
        chroma_stride,
    );
    copy_plane(frame.v(), chroma_width, &mut dst[geometry.v_offset()..end], chroma_stride);
    Ok(end)
}

fn copy_plane(src: &[u8], width: usize, dst: &mut [u8], stride: usize) {
    if width == 0 {
        return;
    }
    if stride == width {
        dst[..src.len()].copy_from_slice(src);
        return;
    }
    for (row, line) in src.chunks_exact(width).enumerate() {
        let start = row * stride;
        dst[start..start + width].copy_from_slice(line);
    }
}

/// Pairs each raw frame with an input buffer and drains one output buffer per
/// iteration. Holds at most one buffer of each kind at a time.
pub struct FramePump<'e, E: EncoderBackend> {
    encoder: &'e mut E,
    ports: NegotiatedPorts,
    layout: FrameLayout,
    /// Staging for compressed payloads, reused every iteration
    scratch: Vec<u8>,
    options: PumpOptions,
    stats: PumpStats,
}

impl<'e, E: EncoderBackend> FramePump<'e, E> {
    pub fn new(encoder: &'e mut E, ports: NegotiatedPorts, options: PumpOptions) -> Self {
        let layout = FrameLayout::new(ports.input.width, ports.input.height);
        Self {
            encoder,
            ports,
            layout,
            scratch: vec![0u8; layout.luma_len()],
            options,
            stats: PumpStats::default(),
        }
    }

    pub fn stats(&self) -> &PumpStats {
        &self.stats
    }

    pub fn into_stats(self) -> PumpStats {
        self.stats
    }

    /// Run until the source goes away or the bus stops. Both are checked
    /// between iterations only.
    pub fn run<S, P>(&mut self, source: &S, publisher: &P) -> StopReason
    where
        S: PixelSource + ?Sized,
        P: Publisher + ?Sized,
    {
        loop {
            if !source.is_valid() {
                info!("Frame source '{}' is no longer valid", source.name());
                return StopReason::SourceLost;
            }
            if !publisher.is_running() {
                info!("Bus stopped");
                return StopReason::BusStopped;
            }
            self.step(source, publisher);
        }
    }

    pub fn step<S, P>(&mut self, source: &S, publisher: &P) -> Iteration
    where
        S: PixelSource + ?Sized,
        P: Publisher + ?Sized,
    {
        source.wait();
        let sample_time = SystemTime::now();
        let started = Instant::now();
        self.stats.iterations += 1;

        let input = match source.locked() {
            Ok(region) => self.fill_input(&region),
            Err(e) => {
                self.stats.transient_errors += 1;
                warn!("Not encoding this frame: {}", e);
                None
            }
        };

        let fed = match input {
            Some(buffer) => {
                if let Err(e) = self.encoder.submit_input_buffer(buffer) {
                    self.transient("submitting input buffer", &e);
                }
                true
            }
            None => {
                self.stats.dropped_frames += 1;
                metrics::counter!("frames_dropped").increment(1);
                debug!("No input buffer filled, dropping frame");
                false
            }
        };

        let payload_len = self.drain_output();
        if payload_len == 0 {
            self.stats.empty_outputs += 1;
            return Iteration { fed, published: 0 };
        }

        let frame = EncodedFrame {
            fourcc: self.ports.codec.fourcc().unwrap_or("h264"),
            width: self.layout.width,
            height: self.layout.height,
            payload: &self.scratch[..payload_len],
            captured_at: sample_time,
        };
        publisher.send(&frame, sample_time, self.options.sender_stamp);

        let elapsed = started.elapsed();
        self.stats.published += 1;
        self.stats.payload_bytes += payload_len as u64;
        metrics::counter!("frames_published").increment(1);
        metrics::histogram!("encode_latency_us").record(elapsed.as_micros() as f64);
        if self.options.verbose {
            info!(
                "Frame size = {} bytes; encoding took {} microseconds.",
                payload_len,
                elapsed.as_micros()
            );
        }

        Iteration {
            fed,
            published: payload_len,
        }
    }

    /// Runs with the source locked: take an input buffer and copy the frame in.
    fn fill_input(&mut self, region: &[u8]) -> Option<E::Buffer> {
        let mut buffer = self.encoder.acquire_input_buffer(self.ports.input.port)?;

        let copied = match RawFrame::new(region, self.layout) {
            Some(frame) => copy_into_port_layout(&frame, &self.ports.input, buffer.as_mut_slice())
                .map_err(|e| {
                    format!(
                        "input buffer holds {} bytes, frame needs {}",
                        e.capacity, e.needed
                    )
                }),
            None => Err(format!(
                "source region of {} bytes is short of a {} byte frame",
                region.len(),
                self.layout.frame_len()
            )),
        };

        match copied {
            Ok(_) => buffer.set_filled_len(self.layout.frame_len()),
            Err(reason) => {
                self.stats.transient_errors += 1;
                warn!("Not encoding this frame: {}", reason);
                buffer.set_filled_len(0);
            }
        }
        Some(buffer)
    }

    /// Take one output buffer if there is one, stage its payload and hand the
    /// buffer straight back. Returns the payload length.
    fn drain_output(&mut self) -> usize {
        let Some(mut buffer) = self.encoder.acquire_output_buffer(self.ports.output.port) else {
            return 0;
        };

        let len = buffer.filled_len();
        if len > self.scratch.len() {
            warn!(
                "Compressed frame of {} bytes exceeds staging buffer of {}, growing",
                len,
                self.scratch.len()
            );
            self.scratch.resize(len, 0);
        }
        self.scratch[..len].copy_from_slice(buffer.filled());
        buffer.set_filled_len(0);

        if let Err(e) = self.encoder.resubmit_output_buffer(buffer) {
            self.transient("resubmitting output buffer", &e);
        }
        len
    }

    fn transient(&mut self, what: &str, error: &EncoderError) {
        self.stats.transient_errors += 1;
        if self.options.verbose {
            warn!("Error {}: {}", what, error);
        } else {
            debug!("Error {}: {}", what, error);
        }
    }
}
