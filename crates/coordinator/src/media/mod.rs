//! Local media acquisition and stream handles
//!
//! The coordinator acquires capture through the [`MediaSource`] trait and
//! never encodes media itself; tracks are attached to peer links as-is.
//! The local stream and any screen-share stream are shared read-only across
//! all links; only the coordinator stops them, on disposal or explicit
//! toggle-off.

use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Stream id shared by all locally published tracks
pub const LOCAL_STREAM_ID: &str = "meshcall";

/// The local capture stream: one audio track, optionally one camera track.
///
/// "Enablement" is a pair of flags consulted by whatever feeds samples into
/// the tracks; toggling never renegotiates.
#[derive(Clone)]
pub struct LocalMedia {
    audio: Arc<TrackLocalStaticSample>,
    video: Option<Arc<TrackLocalStaticSample>>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
}

impl LocalMedia {
    /// Wrap freshly captured tracks, both starting enabled
    pub fn new(
        audio: Arc<TrackLocalStaticSample>,
        video: Option<Arc<TrackLocalStaticSample>>,
    ) -> Self {
        let has_video = video.is_some();
        Self {
            audio,
            video,
            audio_enabled: Arc::new(AtomicBool::new(true)),
            video_enabled: Arc::new(AtomicBool::new(has_video)),
        }
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.audio)
    }

    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.video.as_ref().map(Arc::clone)
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    /// Flip audio enablement; returns the new state
    pub fn toggle_audio(&self) -> bool {
        !self.audio_enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Flip video enablement; returns the new state
    pub fn toggle_video(&self) -> bool {
        !self.video_enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Set audio enablement directly; used when honoring a requested mute
    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Set video enablement directly
    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Disable both tracks; called on disposal
    pub fn stop(&self) {
        self.audio_enabled.store(false, Ordering::SeqCst);
        self.video_enabled.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("has_video", &self.video.is_some())
            .field("audio_enabled", &self.is_audio_enabled())
            .field("video_enabled", &self.is_video_enabled())
            .finish()
    }
}

/// A captured display track plus its end-of-capture notification.
///
/// The source fires [`ScreenShare::notify_ended`] when capture stops from
/// the outside (for example the user dismissing the share); the coordinator
/// watches for it and auto-stops the share.
#[derive(Clone)]
pub struct ScreenShare {
    track: Arc<TrackLocalStaticSample>,
    ended: Arc<watch::Sender<bool>>,
}

impl ScreenShare {
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            track,
            ended: Arc::new(ended),
        }
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    /// Signal that the underlying capture has ended
    pub fn notify_ended(&self) {
        self.ended.send_replace(true);
    }

    pub fn has_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Resolve once the capture ends; immediately if it already has
    pub async fn wait_ended(&self) {
        let mut rx = self.ended.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl fmt::Debug for ScreenShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScreenShare")
            .field("track_id", &self.track.id())
            .field("ended", &self.has_ended())
            .finish()
    }
}

/// Remote track references for one participant, cleared when the backing
/// link degrades
#[derive(Clone, Default)]
pub struct RemoteStreams {
    pub audio: Option<Arc<TrackRemote>>,
    pub video: Option<Arc<TrackRemote>>,
}

impl RemoteStreams {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

impl fmt::Debug for RemoteStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStreams")
            .field("audio", &self.audio.is_some())
            .field("video", &self.video.is_some())
            .finish()
    }
}

/// Capture device boundary
///
/// Acquisition failure during [`MediaSource::capture`] is fatal to session
/// bootstrap; display capture failure only fails the screenshare toggle.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire the local microphone/camera stream
    async fn capture(&self) -> Result<LocalMedia>;

    /// Acquire a display stream for screensharing
    async fn capture_display(&self) -> Result<ScreenShare>;
}

/// A [`MediaSource`] backed by sample-fed local tracks with Opus/VP8
/// capabilities. No hardware dependency; whatever owns the call feeds
/// samples into the returned tracks.
#[derive(Debug, Clone, Default)]
pub struct SampleMediaSource {
    audio_only: bool,
}

impl SampleMediaSource {
    pub fn new() -> Self {
        Self { audio_only: false }
    }

    /// Produce capture streams without a camera track
    pub fn audio_only() -> Self {
        Self { audio_only: true }
    }

    fn audio_track() -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            format!("audio-{}", Uuid::new_v4()),
            LOCAL_STREAM_ID.to_owned(),
        ))
    }

    fn video_track(label: &str) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            format!("{}-{}", label, Uuid::new_v4()),
            LOCAL_STREAM_ID.to_owned(),
        ))
    }
}

#[async_trait]
impl MediaSource for SampleMediaSource {
    async fn capture(&self) -> Result<LocalMedia> {
        let video = (!self.audio_only).then(|| Self::video_track("camera"));
        Ok(LocalMedia::new(Self::audio_track(), video))
    }

    async fn capture_display(&self) -> Result<ScreenShare> {
        Ok(ScreenShare::new(Self::video_track("screen")))
    }
}

/// A [`MediaSource`] that always fails; exercises the fatal-bootstrap path
#[derive(Debug, Clone, Default)]
pub struct UnavailableMediaSource;

#[async_trait]
impl MediaSource for UnavailableMediaSource {
    async fn capture(&self) -> Result<LocalMedia> {
        Err(Error::MediaError("capture devices unavailable".into()))
    }

    async fn capture_display(&self) -> Result<ScreenShare> {
        Err(Error::MediaError("display capture unavailable".into()))
    }
}
