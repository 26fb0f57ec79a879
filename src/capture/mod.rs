pub mod frame;
#[cfg(target_os = "linux")]
pub mod shm;
pub mod source;

pub use frame::{FrameLayout, RawFrame};
#[cfg(target_os = "linux")]
pub use shm::SharedMemorySource;
pub use source::{FrameLock, PixelSource};
