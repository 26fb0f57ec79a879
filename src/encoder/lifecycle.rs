//! Component bring-up and teardown

use tracing::{debug, info, instrument, warn};

use crate::encoder::{ComponentState, EncoderBackend, PortPair};
use crate::error::{EncoderError, LifecycleError, LifecycleStep};

/// A teardown step that failed; teardown carried on regardless
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub step: LifecycleStep,
    pub error: EncoderError,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub steps_attempted: usize,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Owns the component and remembers how far it was brought up, so teardown
/// only undoes what was actually done.
pub struct Lifecycle<E: EncoderBackend> {
    encoder: E,
    ports: PortPair,
    state: ComponentState,
    input_enabled: bool,
    output_enabled: bool,
    released: bool,
}

impl<E: EncoderBackend> Lifecycle<E> {
    pub fn new(encoder: E, ports: PortPair) -> Self {
        Self {
            encoder,
            ports,
            state: ComponentState::Loaded,
            input_enabled: false,
            output_enabled: false,
            released: false,
        }
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut E {
        &mut self.encoder
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn bring_up(&mut self) -> Result<(), LifecycleError> {
        self.prepare()?;
        self.execute()
    }

    /// Loaded -> Idle, then allocate both buffer pools.
    #[instrument(skip(self), fields(component = self.encoder.name()))]
    pub fn prepare(&mut self) -> Result<(), LifecycleError> {
        if self.released {
            return Err(LifecycleError {
                step: LifecycleStep::EnterIdle,
                source: EncoderError::Released,
            });
        }

        info!("encode to idle...");
        self.encoder
            .change_state(ComponentState::Idle)
            .map_err(|source| LifecycleError {
                step: LifecycleStep::EnterIdle,
                source,
            })?;
        self.state = ComponentState::Idle;

        info!("enabling port buffers for {}...", self.ports.input);
        self.encoder
            .enable_port_buffers(self.ports.input)
            .map_err(|source| LifecycleError {
                step: LifecycleStep::EnableInput,
                source,
            })?;
        self.input_enabled = true;

        info!("enabling port buffers for {}...", self.ports.output);
        self.encoder
            .enable_port_buffers(self.ports.output)
            .map_err(|source| LifecycleError {
                step: LifecycleStep::EnableOutput,
                source,
            })?;
        self.output_enabled = true;
        Ok(())
    }

    /// Idle -> Executing.
    pub fn execute(&mut self) -> Result<(), LifecycleError> {
        info!("encode to executing...");
        self.encoder
            .change_state(ComponentState::Executing)
            .map_err(|source| LifecycleError {
                step: LifecycleStep::EnterExecuting,
                source,
            })?;
        self.state = ComponentState::Executing;
        Ok(())
    }

    /// Best-effort teardown. Every step is marked done whether or not it
    /// succeeded, so calling this again does nothing.
    pub fn tear_down(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.released {
            return report;
        }
        info!("Teardown.");

        if self.input_enabled {
            self.input_enabled = false;
            let port = self.ports.input;
            Self::attempt(&mut report, LifecycleStep::DisableInput, || {
                self.encoder.disable_port_buffers(port)
            });
        }
        if self.output_enabled {
            self.output_enabled = false;
            let port = self.ports.output;
            Self::attempt(&mut report, LifecycleStep::DisableOutput, || {
                self.encoder.disable_port_buffers(port)
            });
        }
        if self.state == ComponentState::Executing {
            self.state = ComponentState::Idle;
            Self::attempt(&mut report, LifecycleStep::ReturnToIdle, || {
                self.encoder.change_state(ComponentState::Idle)
            });
        }
        if self.state == ComponentState::Idle {
            self.state = ComponentState::Loaded;
            Self::attempt(&mut report, LifecycleStep::ReturnToLoaded, || {
                self.encoder.change_state(ComponentState::Loaded)
            });
        }

        self.released = true;
        Self::attempt(&mut report, LifecycleStep::Release, || self.encoder.release());
        report
    }

    fn attempt(
        report: &mut TeardownReport,
        step: LifecycleStep,
        op: impl FnOnce() -> Result<(), EncoderError>,
    ) {
        report.steps_attempted += 1;
        match op() {
            Ok(()) => debug!("{} done", step),
            Err(error) => {
                warn!("{} failed: {}", step, error);
                report.failures.push(TeardownFailure { step, error });
            }
        }
    }
}

impl<E: EncoderBackend> Drop for Lifecycle<E> {
    fn drop(&mut self) {
        let _ = self.tear_down();
    }
}
