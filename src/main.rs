//! Feeds raw frames from shared memory through an H.264 encoder component

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tokio::io::AsyncWrite;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use h264_pump::capture::SharedMemorySource;
use h264_pump::encoder::{OpenH264Compressor, PlatformGuard, SoftPlatform};
use h264_pump::error::{exit, SessionError};
use h264_pump::pipeline::publish::write_elementary_stream;
use h264_pump::pipeline::{ChannelPublisher, PumpOptions, Session, SessionSettings};
use h264_pump::utils::{self, Overrides};
use h264_pump::{Config, CONFIG};

fn cli() -> Command {
    Command::new("h264-pump")
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("cid")
                .short('c')
                .long("cid")
                .value_name("SESSION")
                .help("Bus session the encoded stream is published on")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .value_name("SHM")
                .help("Name of the shared memory segment holding raw frames"),
        )
        .arg(
            Arg::new("width")
                .short('w')
                .long("width")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("height")
                .short('H')
                .long("height")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("gop")
                .short('g')
                .long("gop")
                .help("Frames between key frames [default: 10]")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("bitrate")
                .short('b')
                .long("bitrate")
                .help("Target bitrate in bits per second [default: 1000000]")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("fps")
                .short('f')
                .long("fps")
                .help("Frame rate [default: 30]")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("id")
                .short('i')
                .long("id")
                .help("Instance id stamped on every published frame")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Report per-frame size and encode latency")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("TOML file layered under environment and command line")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Write the elementary stream here instead of stdout")
                .value_parser(value_parser!(PathBuf)),
        )
}

fn overrides(matches: &ArgMatches) -> Overrides {
    Overrides {
        session: matches.get_one::<u16>("cid").copied(),
        name: matches.get_one::<String>("name").cloned(),
        width: matches.get_one::<u32>("width").copied(),
        height: matches.get_one::<u32>("height").copied(),
        gop: matches.get_one::<u32>("gop").copied(),
        bitrate: matches.get_one::<u32>("bitrate").copied(),
        frame_rate: matches.get_one::<u32>("fps").copied(),
        instance_id: matches.get_one::<u32>("id").copied(),
        verbose: matches.get_flag("verbose"),
        output: matches.get_one::<PathBuf>("output").cloned(),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "h264_pump=debug" } else { "h264_pump=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let matches = cli().get_matches();
    let overrides = overrides(&matches);
    init_tracing(overrides.verbose);

    let config_file = matches.get_one::<PathBuf>("config");
    let config = match utils::load_config(config_file.map(PathBuf::as_path), &overrides) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return Ok(ExitCode::from(exit::CONFIG));
        }
    };
    CONFIG.store(Arc::new(config.clone()));
    info!("h264-pump launching...");

    let source = match SharedMemorySource::attach(&config.stream.name) {
        Ok(source) => Arc::new(source),
        Err(e) => {
            error!("{}", e);
            return Ok(ExitCode::from(exit::SHARED_MEMORY));
        }
    };

    let (publisher, rx) =
        ChannelPublisher::bounded(config.stream.session, config.pipeline.channel_capacity);
    let shutdown = publisher.shutdown_handle();

    let writer: Box<dyn AsyncWrite + Unpin + Send> = match &config.pipeline.output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .wrap_err_with(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };
    let writer_handle = tokio::spawn(write_elementary_stream(rx, writer));

    let waker = Arc::clone(&source);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Interrupted, stopping");
        shutdown.stop();
        // A stalled producer leaves the pump parked on the condition variable.
        if let Err(e) = waker.notify_all() {
            warn!("Could not wake the frame pump: {}", e);
        }

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted again, exiting");
            std::process::exit(130);
        }
    });

    let outcome = tokio::task::spawn_blocking(move || run_pump(&CONFIG.load(), &source, publisher))
        .await
        .map_err(|e| eyre!("frame pump panicked: {}", e))?;

    match writer_handle.await {
        Ok(Ok(summary)) => info!(
            "Wrote {} frames, {} bytes of elementary stream",
            summary.frames, summary.bytes
        ),
        Ok(Err(e)) => warn!("Writing elementary stream failed: {}", e),
        Err(e) => warn!("Elementary stream writer panicked: {}", e),
    }

    match outcome {
        Ok(()) => Ok(ExitCode::from(exit::SUCCESS)),
        Err(e) => {
            error!("{}", e);
            Ok(ExitCode::from(e.exit_code()))
        }
    }
}

/// Runs on a blocking thread: the pump waits on the source's condition variable.
fn run_pump(
    config: &Config,
    source: &SharedMemorySource,
    publisher: ChannelPublisher,
) -> std::result::Result<(), SessionError> {
    if let Some(core) = config.pipeline.pin_core {
        utils::pin_current_thread(core);
    }

    let settings = SessionSettings {
        request: config.negotiation_request()?,
        options: PumpOptions {
            sender_stamp: config.stream.instance_id,
            verbose: config.stream.verbose,
        },
    };

    let mut platform = PlatformGuard::init(SoftPlatform::new(OpenH264Compressor::new))?;
    let encoder = platform.create_encoder(&config.encoder.component)?;

    // The session releases the component before the platform goes down.
    let mut session = Session::new(encoder, settings);
    let summary = session.run(source, &publisher)?;
    drop(session);
    drop(platform);

    info!(
        "Stopped ({:?}) after {} frames, {} published",
        summary.reason, summary.stats.iterations, summary.stats.published
    );
    if !summary.teardown.is_clean() {
        warn!("{} teardown steps failed", summary.teardown.failures.len());
    }
    Ok(())
}
