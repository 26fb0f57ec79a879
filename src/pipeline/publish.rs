//! Publishing encoded frames to the bus

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use flume::{Receiver, Sender, TrySendError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace};

/// One compressed frame, borrowed from the pump's staging buffer
#[derive(Debug, Clone, Copy)]
pub struct EncodedFrame<'a> {
    pub fourcc: &'static str,
    pub width: u32,
    pub height: u32,
    pub payload: &'a [u8],
    pub captured_at: SystemTime,
}

/// Downstream consumer of encoded frames
pub trait Publisher {
    /// Fire and forget: must not block the pump.
    fn send(&self, frame: &EncodedFrame<'_>, sample_time: SystemTime, sender_stamp: u32);

    fn is_running(&self) -> bool;
}

/// Owned copy of a published frame
#[derive(Debug, Clone)]
pub struct PublishedFrame {
    pub fourcc: &'static str,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
    pub sample_time: SystemTime,
    pub sender_stamp: u32,
}

/// Stops a publisher from the outside, e.g. on SIGINT
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Publishes into a bounded channel, dropping frames the consumer cannot
/// keep up with
pub struct ChannelPublisher {
    session: u16,
    tx: Sender<PublishedFrame>,
    running: Arc<AtomicBool>,
}

impl ChannelPublisher {
    pub fn bounded(session: u16, capacity: usize) -> (Self, Receiver<PublishedFrame>) {
        let (tx, rx) = flume::bounded(capacity);
        let publisher = Self {
            session,
            tx,
            running: Arc::new(AtomicBool::new(true)),
        };
        (publisher, rx)
    }

    pub fn session(&self) -> u16 {
        self.session
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
        }
    }
}

impl Publisher for ChannelPublisher {
    fn send(&self, frame: &EncodedFrame<'_>, sample_time: SystemTime, sender_stamp: u32) {
        let published = PublishedFrame {
            fourcc: frame.fourcc,
            width: frame.width,
            height: frame.height,
            data: Bytes::copy_from_slice(frame.payload),
            sample_time,
            sender_stamp,
        };
        match self.tx.try_send(published) {
            Ok(()) => trace!("session {}: queued {} bytes", self.session, frame.payload.len()),
            Err(TrySendError::Full(_)) => {
                debug!("session {}: consumer is behind, dropping frame", self.session);
                metrics::counter!("frames_dropped_downstream").increment(1);
            }
            Err(TrySendError::Disconnected(_)) => {
                info!("session {}: consumer went away", self.session);
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.tx.is_disconnected()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub frames: u64,
    pub bytes: u64,
}

/// Append every received frame to `writer` as an H.264 elementary stream
/// until all publishers are gone.
pub async fn write_elementary_stream<W>(
    rx: Receiver<PublishedFrame>,
    mut writer: W,
) -> std::io::Result<StreamSummary>
where
    W: AsyncWrite + Unpin,
{
    let mut summary = StreamSummary::default();
    while let Ok(frame) = rx.recv_async().await {
        writer.write_all(&frame.data).await?;
        summary.frames += 1;
        summary.bytes += frame.data.len() as u64;
    }
    writer.flush().await?;
    Ok(summary)
}
