use serde::{Deserialize, Serialize};

/// Geometry of a tightly packed I420 frame as the producer writes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub width: u32,
    pub height: u32,
}

impl FrameLayout {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of one quarter-resolution chroma plane
    pub fn chroma_len(&self) -> usize {
        self.luma_len() >> 2
    }

    pub fn frame_len(&self) -> usize {
        self.luma_len() * 3 / 2
    }
}

/// Borrowed view of one raw frame: Y, then U, then V
///
/// Only ever built from a locked source region, so it cannot outlive the lock.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    data: &'a [u8],
    layout: FrameLayout,
}

impl<'a> RawFrame<'a> {
    /// Returns `None` when the region is too small for the layout.
    pub fn new(data: &'a [u8], layout: FrameLayout) -> Option<Self> {
        if data.len() < layout.frame_len() {
            return None;
        }
        Some(Self {
            data: &data[..layout.frame_len()],
            layout,
        })
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    pub fn y(&self) -> &'a [u8] {
        &self.data[..self.layout.luma_len()]
    }

    pub fn u(&self) -> &'a [u8] {
        let start = self.layout.luma_len();
        &self.data[start..start + self.layout.chroma_len()]
    }

    pub fn v(&self) -> &'a [u8] {
        let start = self.layout.luma_len() + self.layout.chroma_len();
        &self.data[start..start + self.layout.chroma_len()]
    }
}
