//! Demo binary: an N-party mesh call in one process
//!
//! Spins up an in-memory signaling hub, joins several coordinators to the
//! same session, and exercises mute, screenshare and co-watch while
//! printing roster changes.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p meshcall-demo -- --participants 3 --session movie-night
//! ```

use anyhow::Result;
use clap::Parser;
use meshcall::media::SampleMediaSource;
use meshcall::signaling::MemorySignalingHub;
use meshcall::{CallConfig, CallEventKind, GroupCall, GroupCallOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// meshcall demo
///
/// Runs a full mesh group call between in-process participants.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of participants to join
    #[arg(short, long, default_value_t = 3, env = "MESHCALL_PARTICIPANTS")]
    participants: usize,

    /// Session identifier
    #[arg(short, long, default_value = "demo", env = "MESHCALL_SESSION")]
    session: String,

    /// Seconds to keep the call running before teardown
    #[arg(short, long, default_value_t = 10, env = "MESHCALL_DURATION_SECS")]
    duration_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,webrtc=warn,webrtc_ice=warn")),
        )
        .init();

    let args = Args::parse();
    info!(
        "starting {}-party call in session '{}'",
        args.participants, args.session
    );

    let hub = MemorySignalingHub::new();
    let media = Arc::new(SampleMediaSource::new());
    let mut calls: Vec<GroupCall> = Vec::with_capacity(args.participants);

    for index in 0..args.participants {
        let user_id = format!("user-{index:02}");
        let options = GroupCallOptions::new(&args.session, &user_id, format!("User {index}"))
            .with_config(CallConfig::default().without_ice_servers());
        let call = GroupCall::create(options, Arc::new(hub.transport()), media.clone()).await?;

        let owner = user_id.clone();
        let _sub = call.on(CallEventKind::ParticipantsChanged, move |event| {
            if let meshcall::CallEvent::ParticipantsChanged(roster) = event {
                let summary: Vec<String> = roster
                    .iter()
                    .map(|p| {
                        format!(
                            "{}[{}{}]",
                            p.user_id,
                            if p.is_muted { "m" } else { "-" },
                            if p.is_screensharing { "s" } else { "-" }
                        )
                    })
                    .collect();
                info!("{owner} sees: {}", summary.join(" "));
            }
        });
        calls.push(call);
    }

    // let the mesh settle, then poke at it
    tokio::time::sleep(Duration::from_secs(3)).await;

    if let Some(first) = calls.first() {
        info!("muting {}", first.local_user_id());
        first.toggle_mute().await?;
        first
            .toggle_co_watch(Some("https://example.com/movie".into()))
            .await?;
    }
    if let Some(last) = calls.last() {
        info!("{} starts screensharing", last.local_user_id());
        last.toggle_screenshare().await?;
    }

    tokio::time::sleep(Duration::from_secs(args.duration_secs)).await;

    for call in &calls {
        call.leave().await?;
    }
    info!("call finished");
    Ok(())
}
