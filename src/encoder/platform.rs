//! Process-wide platform setup for the encoder stack

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::encoder::EncoderBackend;
use crate::error::PlatformError;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Host services an encoder component is created from
///
/// Init order is host, client, core; deinit runs in reverse.
pub trait Platform {
    type Encoder: EncoderBackend;

    fn host_init(&mut self);

    fn client_init(&mut self) -> Result<(), PlatformError>;

    fn core_init(&mut self) -> Result<(), PlatformError>;

    fn create_encoder(&mut self, name: &str) -> Result<Self::Encoder, PlatformError>;

    fn core_deinit(&mut self);

    fn client_destroy(&mut self);

    fn host_deinit(&mut self);
}

/// Initialised platform. At most one exists per process; dropping it
/// deinitialises whatever was brought up.
pub struct PlatformGuard<P: Platform> {
    platform: P,
    client_ready: bool,
    core_ready: bool,
}

impl<P: Platform> PlatformGuard<P> {
    pub fn init(platform: P) -> Result<Self, PlatformError> {
        if INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(PlatformError::AlreadyInitialized);
        }

        let mut guard = Self {
            platform,
            client_ready: false,
            core_ready: false,
        };
        guard.platform.host_init();
        guard.platform.client_init()?;
        guard.client_ready = true;
        guard.platform.core_init()?;
        guard.core_ready = true;
        info!("Platform initialized");
        Ok(guard)
    }

    pub fn create_encoder(&mut self, name: &str) -> Result<P::Encoder, PlatformError> {
        let encoder = self.platform.create_encoder(name)?;
        debug!("Created component '{}'", name);
        Ok(encoder)
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }
}

impl<P: Platform> Drop for PlatformGuard<P> {
    fn drop(&mut self) {
        if self.core_ready {
            self.platform.core_deinit();
        }
        if self.client_ready {
            self.platform.client_destroy();
        }
        self.platform.host_deinit();
        INITIALIZED.store(false, Ordering::SeqCst);
        debug!("Platform deinitialized");
    }
}
