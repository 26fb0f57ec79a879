// Software H.264 compression using Cisco OpenH264

use ::openh264::encoder::{Encoder, EncoderConfig as H264Config};
use ::openh264::formats::YUVBuffer;
use ::openh264::OpenH264API;
use tracing::info;

use crate::encoder::soft::Compressor;
use crate::encoder::{BitrateSetting, PortGeometry};
use crate::error::EncoderError;

pub struct OpenH264Compressor {
    encoder: Option<Encoder>,
    geometry: Option<PortGeometry>,
    intra_period: u32,
    frame_count: u64,
}

impl OpenH264Compressor {
    pub fn new() -> Self {
        Self {
            encoder: None,
            geometry: None,
            intra_period: 1,
            frame_count: 0,
        }
    }

    /// Strip stride and slice padding back off into a tight I420 frame.
    fn unpad(frame: &[u8], g: &PortGeometry) -> Result<Vec<u8>, EncoderError> {
        let w = g.width as usize;
        let h = g.height as usize;
        if frame.len() < g.v_offset() + g.chroma_stride() * (h / 2) {
            return Err(EncoderError::Compressor(format!(
                "frame of {} bytes is short for {}x{}",
                frame.len(),
                w,
                h
            )));
        }

        let mut tight = Vec::with_capacity(w * h * 3 / 2);
        let stride = g.stride as usize;
        for row in 0..h {
            tight.extend_from_slice(&frame[row * stride..row * stride + w]);
        }
        let chroma_stride = g.chroma_stride();
        for offset in [g.u_offset(), g.v_offset()] {
            for row in 0..h / 2 {
                let start = offset + row * chroma_stride;
                tight.extend_from_slice(&frame[start..start + w / 2]);
            }
        }
        Ok(tight)
    }
}

impl Default for OpenH264Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for OpenH264Compressor {
    fn configure(
        &mut self,
        input: &PortGeometry,
        bitrate: &BitrateSetting,
        intra_period: u32,
    ) -> Result<(), EncoderError> {
        let api = OpenH264API::from_source();
        let h264_config = H264Config::new()
            .set_bitrate_bps(bitrate.target_bps.get())
            .max_frame_rate(input.frame_rate() as f32)
            .enable_skip_frame(false);

        let encoder = Encoder::with_api_config(api, h264_config).map_err(|e| {
            EncoderError::Compressor(format!("Failed to create OpenH264 encoder: {}", e))
        })?;

        info!(
            "OpenH264 encoder initialized: {}x{} @ {} fps, {} bps, key frame every {} frames",
            input.width,
            input.height,
            input.frame_rate(),
            bitrate.target_bps,
            intra_period
        );

        self.encoder = Some(encoder);
        self.geometry = Some(*input);
        self.intra_period = intra_period.max(1);
        self.frame_count = 0;
        Ok(())
    }

    fn compress(&mut self, frame: &[u8], out: &mut [u8]) -> Result<usize, EncoderError> {
        let geometry = self
            .geometry
            .as_ref()
            .ok_or_else(|| EncoderError::Compressor("Encoder not initialized".to_string()))?;
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| EncoderError::Compressor("Encoder not initialized".to_string()))?;

        if self.frame_count % self.intra_period as u64 == 0 {
            encoder.force_intra_frame();
        }

        let tight = Self::unpad(frame, geometry)?;
        let yuv = YUVBuffer::from_vec(tight, geometry.width as usize, geometry.height as usize);
        let bitstream = encoder
            .encode(&yuv)
            .map_err(|e| EncoderError::Compressor(format!("Encode failed: {}", e)))?;
        let encoded = bitstream.to_vec();
        self.frame_count += 1;

        if encoded.len() > out.len() {
            return Err(EncoderError::InsufficientResources(format!(
                "{} byte frame does not fit a {} byte output buffer",
                encoded.len(),
                out.len()
            )));
        }
        out[..encoded.len()].copy_from_slice(&encoded);
        Ok(encoded.len())
    }
}
