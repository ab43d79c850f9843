use amora::calls::sim::{LoopbackTransportFactory, SimulatedCapture};
use amora::calls::{CaptureFailure, LocalStatus, missed_call_count, recent_calls};
use amora::store::InMemoryCallStore;
use amora::types::{CallKind, DisplayInfo};
use amora::{CallConfig, CallHandle, CallSession, CallView, Collaborators};
use anyhow::{Context, bail};
use chrono::Local;
use clap::{Parser, ValueEnum};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// Two simulated peers calling each other through an in-memory store.
//
// Usage:
//   cargo run                                   # video call, caller hangs up
//   cargo run -- --kind voice --hangup-by receiver
//   cargo run -- --fail-media NotReadableError  # caller's camera is busy
//   cargo run -- --config call.json

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "amora")]
#[command(about = "Simulated call between two users")]
struct Cli {
    #[arg(short, long, value_enum, default_value_t = Kind::Video)]
    kind: Kind,

    /// JSON call settings (ring_timeout_secs, busy_policy, ice_servers)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Make the caller's capture fail with this platform error name
    #[arg(long)]
    fail_media: Option<String>,

    #[arg(long, value_enum, default_value_t = Side::Caller)]
    hangup_by: Side,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Voice,
    Video,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Side {
    Caller,
    Receiver,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CallConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CallConfig::default(),
    };
    let kind = match cli.kind {
        Kind::Voice => CallKind::Voice,
        Kind::Video => CallKind::Video,
    };

    let store = Arc::new(InMemoryCallStore::new());
    store.insert_profile(
        "alice",
        DisplayInfo {
            name: "Alice".to_string(),
            avatar_url: Some("https://example.invalid/alice.jpg".to_string()),
        },
    );
    store.insert_profile(
        "bob",
        DisplayInfo {
            name: "Bob".to_string(),
            avatar_url: None,
        },
    );

    let caller_capture = Arc::new(SimulatedCapture::new());
    if let Some(name) = &cli.fail_media {
        caller_capture.fail_with(CaptureFailure::new(name.clone(), "simulated failure"));
    }
    let (alice, alice_task) = CallSession::new(
        "alice".into(),
        config.clone(),
        Collaborators {
            backend: store.clone(),
            capture: caller_capture,
            transports: Arc::new(LoopbackTransportFactory::new()),
        },
    )
    .spawn();
    let (bob, bob_task) = CallSession::new(
        "bob".into(),
        config,
        Collaborators {
            backend: store.clone(),
            capture: Arc::new(SimulatedCapture::new()),
            transports: Arc::new(LoopbackTransportFactory::new()),
        },
    )
    .spawn();

    alice.sign_in().await?;
    bob.sign_in().await?;
    let mut alice_notices = alice.notices();

    if let Err(e) = alice.start("bob", kind).await {
        if let Ok(notice) = alice_notices.try_recv() {
            warn!("alice sees: {}", notice.user_message());
        }
        bail!("call could not start: {e}");
    }

    let ringing = wait_for(&bob, |v| v.status == LocalStatus::Incoming).await?;
    info!(
        "bob's phone rings: {} is calling",
        ringing
            .remote_display_info
            .map(|d| d.name)
            .unwrap_or_else(|| "unknown".to_string())
    );

    bob.accept().await?;
    wait_for(&alice, |v| v.status == LocalStatus::Active && v.remote_media.is_some()).await?;
    wait_for(&bob, |v| v.status == LocalStatus::Active && v.remote_media.is_some()).await?;
    info!("call connected");

    let muted = alice.toggle_mute().await?;
    info!("alice muted: {muted}");

    let hanging_up = match cli.hangup_by {
        Side::Caller => &alice,
        Side::Receiver => &bob,
    };
    hanging_up.end().await?;
    wait_for(&alice, |v| v.status == LocalStatus::Idle).await?;
    wait_for(&bob, |v| v.status == LocalStatus::Idle).await?;

    for entry in recent_calls(store.as_ref(), &"alice".into(), 5).await? {
        info!(
            "history: {} {:?} call with {} -> {}",
            entry.kind, entry.direction, entry.peer_id, entry.status
        );
    }
    info!(
        "bob has {} missed call(s)",
        missed_call_count(store.as_ref(), &"bob".into()).await?
    );

    drop(alice);
    drop(bob);
    alice_task.await?;
    bob_task.await?;
    Ok(())
}

async fn wait_for(
    handle: &CallHandle,
    done: impl FnMut(&CallView) -> bool,
) -> Result<CallView, anyhow::Error> {
    let mut view = handle.watch();
    let reached = tokio::time::timeout(STEP_TIMEOUT, view.wait_for(done))
        .await
        .context("timed out waiting for call state")??;
    Ok(reached.clone())
}
