//! spotd daemon
//!
//! Starts the command server, the session engine and the audio sink, then
//! runs the coordination loop on the main thread until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spotd::{
    audio::{create_shared_queue, NullSink, SharedRelayQueue, SinkWorker},
    config::{AppConfig, OutputKind},
    constants::VERSION,
    coordinator::{CoordinationLoop, Notifier, SessionHooks, SignalRelay},
    error::SessionError,
    network::CommandServer,
    session::{Credentials, SessionEngine, SimulatedEngine},
    Error,
};

/// Exit status used when the session rejects the credentials
const EXIT_LOGIN_FAILED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "spotd", version, about = "Playback-control daemon")]
struct Args {
    /// Account user name
    #[arg(short = 'u', long)]
    username: String,

    /// Account password
    #[arg(short = 'p', long)]
    password: String,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Override the command server port
    #[arg(long)]
    port: Option<u16>,

    /// Override the command server bind address
    #[arg(long)]
    bind: Option<String>,
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            match e.downcast_ref::<Error>() {
                Some(Error::Session(SessionError::LoginFailed(_))) => {
                    ExitCode::from(EXIT_LOGIN_FAILED)
                }
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run(args: Args) -> Result<()> {
    tracing::info!("Starting spotd v{}", VERSION);

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    let relay = create_shared_queue();
    let notifier = Notifier::new();

    let mut sink = start_sink(&config, relay.clone())?;

    let server = {
        let notifier = notifier.clone();
        CommandServer::start(&config.server, move |command| notifier.submit(command))
            .context("Failed to start command server")?
    };

    tracing::debug!(
        cache = %config.session.cache_location.display(),
        settings = %config.session.settings_location.display(),
        user_agent = %config.session.user_agent,
        "Creating session"
    );
    let hooks = Arc::new(SessionHooks::new(notifier.clone(), relay.clone()));
    let mut engine =
        SimulatedEngine::new(config.engine.clone(), hooks).context("Unable to create session")?;
    engine.login(&Credentials::new(args.username, args.password))?;

    let mut signals =
        SignalRelay::start(notifier.clone()).context("Failed to install signal handlers")?;

    let mut coordinator = CoordinationLoop::new(&notifier, engine, relay);
    coordinator.attach_server(server);
    let outcome = coordinator.run();

    signals.stop();
    sink.stop();

    let stats = sink.stats();
    tracing::info!(
        "Audio sink consumed {} deliveries ({} frames, {} errors)",
        stats.deliveries,
        stats.frames,
        stats.errors
    );

    outcome?;
    tracing::info!("spotd stopped");
    Ok(())
}

fn start_sink(config: &AppConfig, relay: SharedRelayQueue) -> Result<SinkWorker> {
    match config.audio.output {
        OutputKind::Null => Ok(SinkWorker::start(relay, || Ok(NullSink))?),
        OutputKind::Device => start_device_sink(config, relay),
    }
}

#[cfg(feature = "device-output")]
fn start_device_sink(config: &AppConfig, relay: SharedRelayQueue) -> Result<SinkWorker> {
    let device = config.audio.device.clone();
    Ok(SinkWorker::start(relay, move || {
        spotd::audio::DeviceSink::new(device.as_deref())
    })?)
}

#[cfg(not(feature = "device-output"))]
fn start_device_sink(_config: &AppConfig, _relay: SharedRelayQueue) -> Result<SinkWorker> {
    anyhow::bail!("audio.output = \"device\" requires the `device-output` feature")
}
