//! Shared helpers for coordinator integration tests

use meshcall::media::SampleMediaSource;
use meshcall::signaling::MemorySignalingHub;
use meshcall::{CallConfig, GroupCall, GroupCallOptions, MediaSource};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Initialize tracing for tests (call once per test)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,webrtc=warn,webrtc_ice=warn,webrtc_mdns=error")
        .try_init();
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Join `session` on the hub as `user` with in-process-friendly settings
/// (host candidates only)
pub async fn join_call(hub: &MemorySignalingHub, session: &str, user: &str) -> GroupCall {
    join_call_with_media(hub, session, user, Arc::new(SampleMediaSource::new())).await
}

pub async fn join_call_with_media(
    hub: &MemorySignalingHub,
    session: &str,
    user: &str,
    media: Arc<dyn MediaSource>,
) -> GroupCall {
    let options = GroupCallOptions::new(session, user, user.to_uppercase())
        .with_config(CallConfig::default().without_ice_servers());
    GroupCall::create(options, Arc::new(hub.transport()), media)
        .await
        .expect("call bootstrap failed")
}
