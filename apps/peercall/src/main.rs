use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use peercall_core::config::{self, Config, ENV_TURN_CREDENTIAL, ENV_TURN_USERNAME};
use peercall_core::media::SyntheticMediaSource;
use peercall_core::peer::RtcPeerFactory;
use peercall_core::signaling::WebSocketConnector;
use peercall_core::telemetry::{self, LogConfig, LogLevel};
use peercall_core::{CallEvent, CallHandle, ChannelState, Controller};

#[derive(Parser, Debug)]
#[command(
    name = "peercall",
    about = "One-to-one WebRTC call over a signaling relay",
    version
)]
struct Cli {
    #[arg(long, value_name = "URL", help = "Signaling relay (ws:// or wss://)")]
    url: Option<String>,

    #[arg(long, value_name = "ID", help = "Participant id to register with the relay")]
    id: Option<String>,

    #[arg(
        long,
        value_name = "URLS",
        help = "Comma-separated ICE server URLs; empty disables STUN/TURN"
    )]
    ice: Option<String>,

    #[arg(long = "ready-timeout-ms", value_name = "MS")]
    ready_timeout_ms: Option<u64>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "PEERCALL_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "PEERCALL_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join the relay and answer incoming calls
    Listen,
    /// Call another participant
    Call {
        #[arg(value_name = "PEER")]
        peer: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config()).context("logging initialization failed")?;

    let config = build_config(&cli)?;
    debug!(
        url = %config.signal_url,
        id = %config.self_id,
        ice_servers = config.ice_servers.len(),
        "configuration loaded"
    );
    println!("You are {}", config.self_id);

    let controller = Controller::new(
        config,
        Arc::new(WebSocketConnector),
        Arc::new(RtcPeerFactory),
        Arc::new(SyntheticMediaSource::audio_video()),
    );
    let (handle, mut task) = controller.spawn();
    let events = handle.subscribe();

    handle
        .connect()
        .await
        .context("could not reach the signaling relay")?;
    match cli.command {
        Command::Listen => info!("waiting for incoming calls"),
        Command::Call { peer } => {
            handle
                .place_call(peer.as_str())
                .await
                .with_context(|| format!("calling {peer} failed"))?;
        }
    }

    follow(&handle, events, &mut task).await?;
    drop(handle);
    task.await.context("controller task failed")?;
    Ok(())
}

fn build_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::from_env().context("invalid PEERCALL_* environment")?;
    if let Some(url) = &cli.url {
        config = config.with_signal_url(url)?;
    }
    if let Some(id) = cli.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        config = config.with_self_id(id);
    }
    if let Some(ice) = &cli.ice {
        config.ice_servers = config::parse_ice_servers(
            ice,
            std::env::var(ENV_TURN_USERNAME).ok(),
            std::env::var(ENV_TURN_CREDENTIAL).ok(),
        );
    }
    if let Some(ms) = cli.ready_timeout_ms.filter(|ms| *ms > 0) {
        config = config.with_ready_timeout(Duration::from_millis(ms));
    }
    Ok(config)
}

/// Prints call progress until interrupted, then hangs up.
async fn follow(
    handle: &CallHandle,
    mut events: broadcast::Receiver<CallEvent>,
    task: &mut JoinHandle<()>,
) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut joined = false;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted; hanging up");
                break;
            }
            result = &mut *task => {
                result.context("controller task failed")?;
                bail!("controller stopped unexpectedly");
            }
            event = events.recv() => match event {
                Ok(CallEvent::Joined) => {
                    joined = true;
                    print_status(ChannelState::Open, joined);
                }
                Ok(CallEvent::Channel(state)) => {
                    if state != ChannelState::Open {
                        joined = false;
                    }
                    print_status(state, joined);
                    if state == ChannelState::Closed {
                        println!("Signaling channel closed; press Ctrl-C to exit");
                    }
                }
                Ok(CallEvent::Negotiation(state)) => println!("Call: {state}"),
                Ok(CallEvent::RemoteTrack { id, kind }) => println!("Remote {kind} track {id}"),
                Ok(CallEvent::Link(state)) => println!("Peer connection: {state}"),
                Ok(CallEvent::RelayError(message)) => println!("Relay error: {message}"),
                Ok(CallEvent::AnswerUndelivered { to, reason }) => {
                    println!("Could not answer {to}: {reason}")
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "call event stream lagged"),
                // `handle` keeps the sender alive; a stopped controller shows up on `task`.
                Err(RecvError::Closed) => break,
            }
        }
    }

    handle.hangup().await?;
    Ok(())
}

fn print_status(state: ChannelState, joined: bool) {
    println!(
        "WS: {state} | Joined: {}",
        if joined { "yes" } else { "no" }
    );
}
