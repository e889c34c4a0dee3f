//! Room call client
//!
//! Joins a room through the relay, prints chat messages from the other
//! participant and sends every line typed on stdin.
//!
//! # Usage
//!
//! ```bash
//! # Open a room
//! cargo run --bin room_client -- --room demo --name alice --role host
//!
//! # Join it from another machine
//! cargo run --bin room_client -- \
//!   --signaling-url wss://relay.example.com \
//!   --room demo --name bob --role guest --no-video
//!
//! # Load everything else from a JSON config
//! cargo run --bin room_client -- --config ./room.json --room demo --name carol
//! ```
//!
//! Typing `/reconnect` rebuilds the peer connection, `/stats` prints the
//! latest transport statistics and `/quit` leaves the room.

use anyhow::Context;
use clap::Parser;
use roomcall_webrtc::{Role, RoomSession, SampleTrackDevice, SessionConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Two-party WebRTC room call client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay base URL
    #[arg(
        long,
        default_value = "ws://localhost:8080",
        env = "ROOMCALL_SIGNALING_URL"
    )]
    signaling_url: String,

    /// Room identifier
    #[arg(short, long, env = "ROOMCALL_ROOM")]
    room: String,

    /// Display name announced to the room
    #[arg(short, long, env = "ROOMCALL_NAME")]
    name: String,

    /// host opens the room, guest joins it
    #[arg(long, default_value = "host", env = "ROOMCALL_ROLE")]
    role: RoleArg,

    /// Do not send audio
    #[arg(long, default_value_t = false)]
    no_audio: bool,

    /// Do not send video
    #[arg(long, default_value_t = false)]
    no_video: bool,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "ROOMCALL_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// JSON session config; command line values take precedence
    #[arg(short, long, env = "ROOMCALL_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum RoleArg {
    Host,
    Guest,
}

impl From<RoleArg> for Role {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::Host => Role::Host,
            RoleArg::Guest => Role::Guest,
        }
    }
}

fn build_config(args: &Args) -> anyhow::Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            SessionConfig::from_json_str(&json)?
        }
        None => SessionConfig::default(),
    };

    config.signaling_url = args.signaling_url.clone();
    config.room_id = args.room.clone();
    config.display_name = args.name.clone();
    config.role = args.role.into();
    config.audio_enabled = !args.no_audio;
    config.video_enabled = !args.no_video;
    if !args.stun_servers.is_empty() {
        config.stun_servers = args.stun_servers.clone();
    }

    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("\nShutdown already in progress, forcing exit");
            std::process::exit(0);
        }
        eprintln!("\nCtrl+C received, leaving room...");
    })
    .context("Failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("roomcall-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing();

    let config = build_config(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        signaling_url = %config.signaling_url,
        room_id = %config.room_id,
        role = %config.role,
        audio = config.audio_enabled,
        video = config.video_enabled,
        "Room client starting"
    );

    let session = RoomSession::start(config, Arc::new(SampleTrackDevice::default()))
        .await
        .context("Failed to start room session")?;

    let _subscription = session.subscribe(|text| println!("< {}", text));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut snapshots = session.watch_snapshot();
    let mut shutdown_check = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/reconnect" => {
                        if !session.reconnect() {
                            println!("Reconnect already in progress");
                        }
                    }
                    "/stats" => match session.connection_stats() {
                        Some(stats) => println!("{}", serde_json::to_string(&stats)?),
                        None => println!("No statistics yet"),
                    },
                    text => {
                        if !session.send_message(text).await {
                            warn!("Chat channel not open, message dropped");
                        }
                    }
                }
            }

            Ok(()) = snapshots.changed() => {
                let snapshot = snapshots.borrow_and_update().clone();
                info!(
                    connection = %snapshot.connection_state,
                    ice = %snapshot.ice_connection_state,
                    chat_open = snapshot.data_channel_open,
                    reconnecting = snapshot.is_reconnecting,
                    "Session state"
                );
            }

            _ = shutdown_check.tick() => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    session.leave().await;
    info!("Left room");
    Ok(())
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
