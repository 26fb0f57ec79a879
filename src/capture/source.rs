use std::ops::Deref;

use crate::error::SourceError;

/// Producer of raw frames guarded by its own wait/lock/unlock primitive
pub trait PixelSource {
    fn name(&self) -> &str;

    /// Size of the raw region in bytes
    fn size(&self) -> usize;

    fn is_valid(&self) -> bool;

    /// Block until the producer signals a new frame.
    fn wait(&self);

    /// Take the region lock. On error the lock is not held.
    fn lock(&self) -> Result<(), SourceError>;

    fn unlock(&self);

    /// The raw region. Readers must hold the lock; use [`PixelSource::locked`].
    fn region(&self) -> &[u8];

    /// Lock the region for the lifetime of the returned guard.
    fn locked(&self) -> Result<FrameLock<'_, Self>, SourceError> {
        self.lock()?;
        Ok(FrameLock { source: self })
    }
}

/// Scoped access to a locked source region, unlocked on drop
pub struct FrameLock<'a, S: PixelSource + ?Sized> {
    source: &'a S,
}

impl<S: PixelSource + ?Sized> Deref for FrameLock<'_, S> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.source.region()
    }
}

impl<S: PixelSource + ?Sized> Drop for FrameLock<'_, S> {
    fn drop(&mut self) {
        self.source.unlock();
    }
}
