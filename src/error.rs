//! Error types for every layer of the encoder pipeline

use std::fmt;

use thiserror::Error;

/// Process exit codes
pub mod exit {
    pub const SUCCESS: u8 = 0;
    pub const SHARED_MEMORY: u8 = 1;
    pub const CLIENT_INIT: u8 = 3;
    pub const PLATFORM_INIT: u8 = 4;
    pub const COMPONENT_CREATE: u8 = 5;
    pub const BRING_UP: u8 = 6;
    pub const CONFIG: u8 = 7;
}

/// A single call into the encoder component failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncoderError {
    #[error("no such port {0}")]
    BadPort(u32),
    #[error("state transition {from} -> {to} is not allowed")]
    IncorrectStateTransition { from: String, to: String },
    #[error("component is already {0}")]
    SameState(String),
    #[error("operation not allowed while component is {0}")]
    IncorrectState(String),
    #[error("port {0} is disabled")]
    PortDisabled(u32),
    #[error("port {0} is already enabled")]
    PortEnabled(u32),
    #[error("unsupported setting: {0}")]
    UnsupportedSetting(String),
    #[error("buffer for port {0} is not owned by the client")]
    BufferNotOwned(u32),
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),
    #[error("compressor failed: {0}")]
    Compressor(String),
    #[error("component has been released")]
    Released,
}

/// Parameter kinds exchanged with the component during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    PortDefinition,
    VideoPortFormat,
    Bitrate,
    IntraPeriod,
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Param::PortDefinition => "port definition",
            Param::VideoPortFormat => "video port format",
            Param::Bitrate => "bitrate",
            Param::IntraPeriod => "intra period",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("invalid negotiation request: {0}")]
    InvalidRequest(String),
    #[error("{param} for port {port} rejected: {source}")]
    Rejected {
        param: Param,
        port: u32,
        #[source]
        source: EncoderError,
    },
    #[error("port {port} accepted {field}={accepted}, requested {requested}")]
    Mismatch {
        port: u32,
        field: &'static str,
        requested: u32,
        accepted: u32,
    },
    #[error("port {port} buffers hold {size} bytes, frame needs {required}")]
    BufferTooSmall {
        port: u32,
        size: usize,
        required: usize,
    },
}

/// Steps of the component lifecycle, used to name what failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStep {
    EnterIdle,
    EnableInput,
    EnableOutput,
    EnterExecuting,
    DisableInput,
    DisableOutput,
    ReturnToIdle,
    ReturnToLoaded,
    Release,
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleStep::EnterIdle => "enter idle",
            LifecycleStep::EnableInput => "enable input port buffers",
            LifecycleStep::EnableOutput => "enable output port buffers",
            LifecycleStep::EnterExecuting => "enter executing",
            LifecycleStep::DisableInput => "disable input port buffers",
            LifecycleStep::DisableOutput => "disable output port buffers",
            LifecycleStep::ReturnToIdle => "return to idle",
            LifecycleStep::ReturnToLoaded => "return to loaded",
            LifecycleStep::Release => "release component",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
#[error("{step} failed: {source}")]
pub struct LifecycleError {
    pub step: LifecycleStep,
    #[source]
    pub source: EncoderError,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("platform is already initialized in this process")]
    AlreadyInitialized,
    #[error("client init failed: {0}")]
    ClientInit(String),
    #[error("core init failed: {0}")]
    CoreInit(String),
    #[error("creating component '{name}' failed: {reason}")]
    ComponentCreate { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to attach to shared memory '{name}': {source}")]
    Attach {
        name: String,
        #[source]
        source: nix::Error,
    },
    #[error("shared memory '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("shared memory '{name}' is malformed: {reason}")]
    Malformed { name: String, reason: String },
    #[error("failed to lock shared memory '{name}': {source}")]
    Lock {
        name: String,
        #[source]
        source: nix::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Everything that can end a run before or instead of a clean shutdown
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("frame source '{0}' is not valid")]
    SourceUnavailable(String),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("bring-up failed: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("session has already run")]
    AlreadyRun,
}

impl SessionError {
    pub fn exit_code(&self) -> u8 {
        match self {
            SessionError::Config(_) => exit::CONFIG,
            SessionError::Source(_) | SessionError::SourceUnavailable(_) => exit::SHARED_MEMORY,
            SessionError::Platform(PlatformError::ClientInit(_)) => exit::CLIENT_INIT,
            SessionError::Platform(PlatformError::CoreInit(_))
            | SessionError::Platform(PlatformError::AlreadyInitialized) => exit::PLATFORM_INIT,
            SessionError::Platform(PlatformError::ComponentCreate { .. }) => {
                exit::COMPONENT_CREATE
            }
            SessionError::Negotiation(_)
            | SessionError::Lifecycle(_)
            | SessionError::AlreadyRun => exit::BRING_UP,
        }
    }
}
