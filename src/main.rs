use anyhow::Context;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use log::{info, warn};
use rtc_calls::calls::sim::{LoopbackBus, SimMediaDevices, SimPeerFactory};
use rtc_calls::calls::{CallHandle, CallManager, CallNotification, CallPlatform};
use rtc_calls::config::RtcSettings;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// Two parties in one process, wired through the loopback chat bus and the
// simulated peer connection. Prints both call logs as JSON when done.
//
// Usage:
//   cargo run                                     # alice calls bob, bob answers, alice hangs up
//   cargo run -- --scenario ignore --timeout 3    # bob never answers
//   cargo run -- --scenario decline               # bob declines
//   cargo run -- --settings rtc.json              # load ICE servers etc. from a settings file

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Callee answers; caller hangs up after the talk time.
    Answer,
    /// Callee never answers; the call times out.
    Ignore,
    /// Callee declines while ringing.
    Decline,
    /// Caller cancels while ringing.
    Cancel,
}

#[derive(Debug, Parser)]
#[command(name = "rtc-calls", about = "Run a simulated call between two local parties")]
struct Args {
    #[arg(long, value_enum, default_value = "answer")]
    scenario: Scenario,

    /// Dialing timeout in seconds (overrides the settings file).
    #[arg(long)]
    timeout: Option<u64>,

    /// JSON settings file (rtcIceConfig, rtcVideoConstraints, rtcDialingTimeoutSeconds).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// How long the connected call lasts, in milliseconds.
    #[arg(long, default_value_t = 500)]
    talk_ms: u64,

    #[arg(long, default_value = "alice")]
    caller: String,

    #[arg(long, default_value = "bob")]
    callee: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let args = Args::parse();
    let mut settings = match &args.settings {
        Some(path) => RtcSettings::load(path)?,
        None => RtcSettings::default(),
    };
    if let Some(timeout) = args.timeout {
        settings.dialing_timeout_seconds = timeout;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(run(args, settings))
}

fn spawn_party(bus: &Arc<LoopbackBus>, id: &str, settings: RtcSettings) -> CallHandle {
    let platform = CallPlatform::new(
        bus.clone(),
        Arc::new(SimPeerFactory::new(id)),
        Arc::new(SimMediaDevices::new()),
    );
    let (manager, handle) = CallManager::new(id, settings, platform);
    bus.register(&handle.signaling());
    tokio::spawn(manager.run());

    let mut notifications = handle.subscribe();
    let who = id.to_string();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            match notification {
                CallNotification::CallUpdated(call) => {
                    info!("[{}] {} {}", who, call.status_text(), call.peer_user_id)
                }
                CallNotification::RingingStarted(key) => info!("[{}] ringing: {}", who, key),
                CallNotification::RemoteStreamUpdated(stream) => {
                    info!("[{}] remote stream with {} tracks", who, stream.tracks().len())
                }
                _ => {}
            }
        }
    });
    handle
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn run(args: Args, settings: RtcSettings) -> anyhow::Result<()> {
    let bus = Arc::new(LoopbackBus::new());
    let timeout = settings.dialing_timeout();
    let caller = spawn_party(&bus, &args.caller, settings.clone());
    let callee = spawn_party(&bus, &args.callee, settings);

    let key = caller.place_call(&args.callee).await?;
    info!("Placed call {} ({:?})", key, args.scenario);
    settle().await;

    match args.scenario {
        Scenario::Answer => {
            callee.answer_call().await?;
            tokio::time::sleep(Duration::from_millis(args.talk_ms)).await;
            caller.end_call().await?;
        }
        Scenario::Ignore => {
            tokio::time::sleep(timeout + Duration::from_millis(200)).await;
        }
        Scenario::Decline => callee.end_call().await?,
        Scenario::Cancel => caller.end_call().await?,
    }
    settle().await;

    for (name, handle) in [(&args.caller, &caller), (&args.callee, &callee)] {
        let session = handle.session().await;
        if session.call_log.is_empty() {
            warn!("{} has no finished calls", name);
        }
        println!("{}: {}", name, serde_json::to_string_pretty(&session.call_log)?);
        handle.shutdown();
    }
    info!("{} signaling messages exchanged", bus.sent_messages().len());
    Ok(())
}
