//! One single-shot encoder run: negotiate, bring up, pump, tear down

use std::fmt;

use tracing::{debug, error, info, instrument};

use crate::capture::PixelSource;
use crate::encoder::lifecycle::{Lifecycle, TeardownReport};
use crate::encoder::negotiate::{negotiate, NegotiatedPorts, NegotiationRequest};
use crate::encoder::EncoderBackend;
use crate::error::SessionError;
use crate::pipeline::publish::Publisher;
use crate::pipeline::pump::{FramePump, PumpOptions, StopReason};
use crate::PumpStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Unconfigured,
    Negotiated,
    Idle,
    Executing,
    Draining,
    Terminated,
}

impl PumpState {
    /// Forward-only transitions; any state may abort to Terminated.
    pub fn can_become(self, next: PumpState) -> bool {
        use PumpState::*;
        matches!(
            (self, next),
            (Unconfigured, Negotiated)
                | (Negotiated, Idle)
                | (Idle, Executing)
                | (Executing, Draining)
                | (Unconfigured | Negotiated | Idle | Draining, Terminated)
        )
    }
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub request: NegotiationRequest,
    pub options: PumpOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub reason: StopReason,
    pub ports: NegotiatedPorts,
    pub stats: PumpStats,
    pub teardown: TeardownReport,
}

pub struct Session<E: EncoderBackend> {
    state: PumpState,
    lifecycle: Lifecycle<E>,
    settings: SessionSettings,
    teardown: Option<TeardownReport>,
}

impl<E: EncoderBackend> Session<E> {
    pub fn new(encoder: E, settings: SessionSettings) -> Self {
        Self {
            state: PumpState::Unconfigured,
            lifecycle: Lifecycle::new(encoder, settings.request.ports),
            settings,
            teardown: None,
        }
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    pub fn lifecycle(&self) -> &Lifecycle<E> {
        &self.lifecycle
    }

    /// Report of the teardown, once the session has terminated
    pub fn teardown_report(&self) -> Option<&TeardownReport> {
        self.teardown.as_ref()
    }

    #[instrument(skip_all, fields(component = self.lifecycle.encoder().name(), source = source.name()))]
    pub fn run<S, P>(&mut self, source: &S, publisher: &P) -> Result<RunSummary, SessionError>
    where
        S: PixelSource + ?Sized,
        P: Publisher + ?Sized,
    {
        if self.state != PumpState::Unconfigured {
            return Err(SessionError::AlreadyRun);
        }

        if !source.is_valid() {
            error!("Frame source '{}' is not valid", source.name());
            self.terminate();
            return Err(SessionError::SourceUnavailable(source.name().to_owned()));
        }

        let ports = match negotiate(self.lifecycle.encoder_mut(), &self.settings.request) {
            Ok(ports) => ports,
            Err(e) => {
                error!("Negotiation failed: {}", e);
                self.terminate();
                return Err(e.into());
            }
        };
        self.transition(PumpState::Negotiated);

        if let Err(e) = self.lifecycle.prepare() {
            error!("Bring-up failed: {}", e);
            self.terminate();
            return Err(e.into());
        }
        self.transition(PumpState::Idle);

        if let Err(e) = self.lifecycle.execute() {
            error!("Bring-up failed: {}", e);
            self.terminate();
            return Err(e.into());
        }
        self.transition(PumpState::Executing);

        let mut pump = FramePump::new(
            self.lifecycle.encoder_mut(),
            ports.clone(),
            self.settings.options,
        );
        let reason = pump.run(source, publisher);
        let stats = pump.into_stats();
        self.transition(PumpState::Draining);
        info!(
            "Stopped after {} frames ({} published, {} dropped)",
            stats.iterations, stats.published, stats.dropped_frames
        );

        let teardown = self.terminate();
        Ok(RunSummary {
            reason,
            ports,
            stats,
            teardown,
        })
    }

    fn transition(&mut self, next: PumpState) {
        debug_assert!(
            self.state.can_become(next),
            "illegal pump transition {} -> {}",
            self.state,
            next
        );
        debug!("pump {} -> {}", self.state, next);
        self.state = next;
    }

    /// Teardown undoes only what was done, so the abbreviated path after a
    /// failed bring-up is the same call.
    fn terminate(&mut self) -> TeardownReport {
        let report = self.lifecycle.tear_down();
        self.transition(PumpState::Terminated);
        self.teardown = Some(report.clone());
        report
    }
}
