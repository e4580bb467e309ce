use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mesh_call::audio::SystemDevices;
use mesh_call::connection::FAILED_TO_CONNECT;
use mesh_call::signaling::SignalingClient;
use mesh_call::webrtc::WebRtcTransportFactory;
use mesh_call::{ClientConfig, Session, SessionConfig, SessionHandle, SessionNotice};

#[derive(Parser, Debug)]
#[command(name = "mesh-call")]
#[command(about = "Headless mesh video call client", long_about = None)]
struct Args {
    /// Signaling server URL (overrides MESH_SIGNALING_URL)
    #[arg(long)]
    url: Option<String>,

    /// Room to join; a new room id is generated when omitted
    #[arg(long, env = "MESH_ROOM")]
    room: Option<String>,

    /// Name shown to other participants
    #[arg(long, env = "MESH_DISPLAY_NAME", default_value = "Guest")]
    name: String,

    /// Join with the microphone muted
    #[arg(long)]
    no_audio: bool,

    /// Join with the camera off
    #[arg(long)]
    video_off: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "MESH_JSON_LOGS")]
    json_logs: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mesh_call=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let mut config = ClientConfig::from_env()?;
    if let Some(url) = args.url {
        config.signaling_url = url;
    }
    let mut identity = SessionConfig::new(args.room, args.name);
    identity.no_audio = args.no_audio;
    identity.video_off = args.video_off;

    info!(
        room_id = %identity.room_id,
        participant_id = %identity.participant_id,
        url = %config.signaling_url,
        "Starting mesh-call"
    );

    let (signaling, events) = match SignalingClient::connect(&config.signaling_url).await {
        Ok(connection) => connection,
        Err(e) => {
            error!(error = %e, "{}", FAILED_TO_CONNECT);
            return Err(e.into());
        }
    };
    let factory = WebRtcTransportFactory::new()?;

    let session = Session::start(
        identity,
        config,
        Arc::new(SystemDevices::new()),
        Arc::new(factory),
        Arc::new(signaling),
        events,
    )
    .await?;

    spawn_observers(&session);
    info!(room_id = %session.room_id(), "Commands: mic, cam, screen, status, leave, end");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let reason = loop {
        tokio::select! {
            reason = session.exited() => break reason,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving");
                session.leave().await;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = run_command(&session, line.trim()).await {
                        warn!(error = %e, "Command failed");
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    stdin_open = false;
                }
            },
        }
    };

    info!(%reason, "Session ended");
    Ok(())
}

async fn run_command(session: &SessionHandle, command: &str) -> mesh_call::Result<()> {
    match command {
        "" => {}
        "mic" => {
            let enabled = session.toggle_microphone().await?;
            info!(enabled, "Microphone toggled");
        }
        "cam" => {
            let enabled = session.toggle_camera().await?;
            info!(enabled, "Camera toggled");
        }
        "screen" => {
            let active = session.toggle_screen_share().await?;
            info!(active, "Screen share toggled");
        }
        "status" => {
            let status = session.status();
            let peers = session.inspect().await?;
            match (
                serde_json::to_string_pretty(&status),
                serde_json::to_string_pretty(&peers),
            ) {
                (Ok(status), Ok(peers)) => println!("{status}\n{peers}"),
                (Err(e), _) | (_, Err(e)) => warn!(error = %e, "Failed to render status"),
            }
        }
        "leave" => session.leave().await,
        "end" => session.end_meeting().await?,
        other => warn!(command = %other, "Unknown command"),
    }
    Ok(())
}

/// Log status changes, notices and metrics as they arrive.
fn spawn_observers(session: &SessionHandle) {
    let mut status = session.subscribe_status();
    tokio::spawn(async move {
        let mut last = String::new();
        while status.changed().await.is_ok() {
            let text = status.borrow_and_update().text.clone();
            if text != last {
                info!(status = %text, "Status");
                last = text;
            }
        }
    });

    let mut notices = session.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice {
                SessionNotice::Alert(message) => warn!(%message, "Alert"),
                SessionNotice::RemoteMedia {
                    display_name,
                    kind,
                    enabled,
                    ..
                } => info!(%display_name, %kind, enabled, "Remote media changed"),
                SessionNotice::ScreenShare {
                    display_name,
                    active,
                } => info!(%display_name, active, "Remote screen share"),
                SessionNotice::TimeWarning { remaining } => {
                    warn!(remaining_secs = remaining.as_secs(), "Session ends soon")
                }
                SessionNotice::Exited(reason) => {
                    info!(%reason, "Exited");
                    break;
                }
            }
        }
    });

    let mut metrics = session.metrics();
    tokio::spawn(async move {
        while metrics.changed().await.is_ok() {
            let snapshot = *metrics.borrow_and_update();
            debug!(
                latency_ms = snapshot.network.latency,
                jitter_ms = snapshot.network.jitter,
                packet_loss = snapshot.network.packet_loss,
                upload_kbps = snapshot.network.bandwidth.upload,
                mos = snapshot.audio.mos,
                "Call quality"
            );
        }
    });
}
