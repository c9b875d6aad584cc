use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;

use tincan::config::Config;
use tincan::media::{RtcSettings, SilentCapture, WebRtcLinkFactory};
use tincan::session::log::SessionLog;
use tincan::session::{NegotiationController, SessionError, SessionState, SessionTimeouts};
use tincan::telemetry::logging::{self, LogConfig, LogLevel};
use tincan::transport::{RelayChannel, TransportError};

#[derive(Parser, Debug)]
#[command(
    name = "tincan",
    about = "Two-party voice calls negotiated through a matchmaking relay"
)]
struct Cli {
    #[arg(long, env = "TINCAN_RELAY_URL")]
    relay: Option<String>,

    #[arg(
        long = "stun",
        env = "TINCAN_STUN_SERVER",
        value_delimiter = ',',
        help = "STUN server URL; repeat for multiple"
    )]
    stun: Vec<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[arg(long, help = "Seconds to wait for the relay to find a partner")]
    match_timeout_secs: Option<u64>,

    #[arg(long, help = "Seconds to allow the offer/answer exchange to finish")]
    negotiation_timeout_secs: Option<u64>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("logging setup failed: {0}")]
    Logging(#[from] logging::InitError),
    #[error("relay connection failed: {0}")]
    Channel(#[from] TransportError),
    #[error("call setup failed: {0}")]
    Session(#[from] SessionError),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("tincan: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let mut config = Config::from_env();
    if let Some(relay) = cli.relay {
        config.relay_url = relay;
    }
    if !cli.stun.is_empty() {
        config.stun_servers = cli.stun;
    }
    if let Some(secs) = cli.match_timeout_secs {
        config.match_timeout = std::time::Duration::from_secs(secs);
    }
    if let Some(secs) = cli.negotiation_timeout_secs {
        config.negotiation_timeout = std::time::Duration::from_secs(secs);
    }

    let log = SessionLog::new();
    let mut entries = log.subscribe();
    tokio::spawn(async move {
        while let Ok(entry) = entries.recv().await {
            println!("{:>8}  {}", entry.kind, entry.message);
        }
    });

    let (channel, channel_events) = RelayChannel::connect(&config.relay_url, log.clone()).await?;
    let factory = Arc::new(WebRtcLinkFactory::new(
        RtcSettings {
            stun_servers: config.stun_servers.clone(),
        },
        Arc::new(SilentCapture::default()),
    ));
    let handle = NegotiationController::launch(
        channel,
        channel_events,
        factory,
        log.clone(),
        SessionTimeouts {
            match_wait: config.match_timeout,
            negotiation: config.negotiation_timeout,
        },
    )
    .await?;

    let mut states = handle.state_changes();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            handle.hang_up("hang_up");
        }
        _ = async {
            loop {
                if *states.borrow_and_update() == SessionState::Ended {
                    break;
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        } => {}
    }

    let final_state = handle.join().await;
    println!("call finished ({final_state:?})");
    Ok(())
}
