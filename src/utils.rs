use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::ConfigError;
use crate::Config;

/// Environment variables look like `H264PUMP__STREAM__WIDTH=1280`
pub const ENV_PREFIX: &str = "H264PUMP";

/// Values given on the command line; they win over every other layer
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub session: Option<u16>,
    pub name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub gop: Option<u32>,
    pub bitrate: Option<u32>,
    pub frame_rate: Option<u32>,
    pub instance_id: Option<u32>,
    pub verbose: bool,
    pub output: Option<PathBuf>,
}

/// Layer defaults, an optional TOML file, the environment and the command
/// line, in that order, and validate the result.
pub fn load_config(file: Option<&Path>, overrides: &Overrides) -> Result<Config, ConfigError> {
    let defaults = config::Config::try_from(&Config::default())?;
    let mut builder = config::Config::builder().add_source(defaults);
    if let Some(path) = file {
        builder = builder.add_source(config::File::from(path).required(true));
    }
    builder = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .set_override_option("stream.session", overrides.session.map(i64::from))?
        .set_override_option("stream.name", overrides.name.clone())?
        .set_override_option("stream.width", overrides.width.map(i64::from))?
        .set_override_option("stream.height", overrides.height.map(i64::from))?
        .set_override_option("stream.instance_id", overrides.instance_id.map(i64::from))?
        .set_override_option("encoder.gop", overrides.gop.map(i64::from))?
        .set_override_option("encoder.bitrate", overrides.bitrate.map(i64::from))?
        .set_override_option("encoder.frame_rate", overrides.frame_rate.map(i64::from))?
        .set_override_option(
            "pipeline.output",
            overrides
                .output
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
        )?;
    if overrides.verbose {
        builder = builder.set_override("stream.verbose", true)?;
    }

    let config: Config = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Pin the calling thread to a CPU core
pub fn pin_current_thread(core: usize) -> bool {
    let Some(cores) = core_affinity::get_core_ids() else {
        warn!("Could not enumerate CPU cores, not pinning");
        return false;
    };
    match cores.into_iter().find(|id| id.id == core) {
        Some(id) => {
            let pinned = core_affinity::set_for_current(id);
            if pinned {
                info!("Pinned frame pump to core {}", core);
            } else {
                warn!("Pinning frame pump to core {} failed", core);
            }
            pinned
        }
        None => {
            warn!("No CPU core {} on this machine", core);
            false
        }
    }
}
