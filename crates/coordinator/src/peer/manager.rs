//! Peer link creation, negotiation and track management

use crate::channels::CONTROL_CHANNEL_LABEL;
use crate::config::CallConfig;
use crate::media::{LocalMedia, ScreenShare};
use crate::peer::PeerLink;
use crate::{Error, Result};
use meshcall_core::ConnectionState;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Deterministic glare avoidance: the participant with the
/// lexicographically smaller id initiates negotiation. Requires ids unique
/// and stable within a session.
pub fn is_initiator(local: &str, remote: &str) -> bool {
    local < remote
}

/// Events surfaced from connection callbacks into the coordinator loop
pub enum PeerEvent {
    /// A local candidate was gathered and must be signaled to the remote
    IceCandidate {
        remote: String,
        candidate: RTCIceCandidateInit,
    },
    /// An inbound media track arrived
    Track {
        remote: String,
        track: Arc<TrackRemote>,
    },
    /// The connection state changed
    StateChanged {
        remote: String,
        state: ConnectionState,
    },
    /// A data channel is available, inbound or self-created
    DataChannel {
        remote: String,
        channel: Arc<RTCDataChannel>,
    },
}

/// Owns every peer link in a session
pub struct PeerLinkManager {
    api: API,
    rtc_config: RTCConfiguration,
    links: RwLock<HashMap<String, Arc<PeerLink>>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerLinkManager {
    pub fn new(config: &CallConfig, events: mpsc::UnboundedSender<PeerEvent>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            rtc_config: config.rtc_configuration(),
            links: RwLock::new(HashMap::new()),
            events,
        })
    }

    /// Get or create the link to `remote_id`; idempotent.
    ///
    /// On creation attaches all current local tracks plus any active screen
    /// track and wires the connection callbacks.
    pub async fn ensure_peer(
        &self,
        remote_id: &str,
        local: &LocalMedia,
        screen: Option<&ScreenShare>,
    ) -> Result<Arc<PeerLink>> {
        if let Some(link) = self.links.read().await.get(remote_id) {
            return Ok(Arc::clone(link));
        }

        info!("creating peer link to {}", remote_id);
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config.clone()).await?);

        let audio: Arc<dyn TrackLocal + Send + Sync> = local.audio_track();
        pc.add_track(audio).await?;
        if let Some(video) = local.video_track() {
            let video: Arc<dyn TrackLocal + Send + Sync> = video;
            pc.add_track(video).await?;
        }
        if let Some(share) = screen {
            if !share.has_ended() {
                let track: Arc<dyn TrackLocal + Send + Sync> = share.track();
                pc.add_track(track).await?;
            }
        }

        self.wire_callbacks(remote_id, &pc);

        let link = Arc::new(PeerLink::new(remote_id, Arc::clone(&pc)));
        let mut links = self.links.write().await;
        if let Some(existing) = links.get(remote_id) {
            // lost a creation race; keep the first link
            let existing = Arc::clone(existing);
            drop(links);
            let _ = pc.close().await;
            return Ok(existing);
        }
        links.insert(remote_id.to_string(), Arc::clone(&link));
        Ok(link)
    }

    fn wire_callbacks(&self, remote_id: &str, pc: &Arc<RTCPeerConnection>) {
        let remote = remote_id.to_string();
        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let remote = remote.clone();
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::IceCandidate {
                            remote,
                            candidate: init,
                        });
                    }
                    Err(e) => warn!("failed to serialize candidate for {}: {}", remote, e),
                }
            })
        }));

        let remote = remote_id.to_string();
        let events = self.events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote = remote.clone();
            let events = events.clone();
            Box::pin(async move {
                debug!("remote {} track from {}", track.kind(), remote);
                let _ = events.send(PeerEvent::Track { remote, track });
            })
        }));

        let remote = remote_id.to_string();
        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let remote = remote.clone();
            let events = events.clone();
            Box::pin(async move {
                if let Some(state) = map_connection_state(s) {
                    let _ = events.send(PeerEvent::StateChanged { remote, state });
                }
            })
        }));

        let remote = remote_id.to_string();
        let events = self.events.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let remote = remote.clone();
            let events = events.clone();
            Box::pin(async move {
                debug!("inbound data channel '{}' from {}", channel.label(), remote);
                let _ = events.send(PeerEvent::DataChannel { remote, channel });
            })
        }));
    }

    /// Initiator side: create the control channel, then an offer, and set
    /// it locally. Returns the SDP to signal.
    pub async fn begin_offer(&self, remote_id: &str) -> Result<String> {
        let link = self.require_link(remote_id).await?;
        let pc = link.pc();

        if link.control().is_none() {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let channel = pc
                .create_data_channel(CONTROL_CHANNEL_LABEL, Some(init))
                .await?;
            link.set_control(Arc::clone(&channel));
            let _ = self.events.send(PeerEvent::DataChannel {
                remote: remote_id.to_string(),
                channel,
            });
        }

        let offer = pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer).await?;
        debug!("offer created for {}", remote_id);
        Ok(sdp)
    }

    /// Non-initiator side: apply the remote offer, flush queued candidates,
    /// answer. Returns the answer SDP to signal back. Also serves
    /// renegotiation offers on an established link.
    pub async fn accept_offer(&self, remote_id: &str, sdp: String) -> Result<String> {
        let link = self.require_link(remote_id).await?;
        let pc = link.pc();

        let offer = RTCSessionDescription::offer(sdp)?;
        pc.set_remote_description(offer).await?;
        self.flush_candidates(&link).await;

        let answer = pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        pc.set_local_description(answer).await?;
        debug!("answer created for {}", remote_id);
        Ok(sdp)
    }

    /// Apply the remote answer and flush queued candidates
    pub async fn accept_answer(&self, remote_id: &str, sdp: String) -> Result<()> {
        let link = self.require_link(remote_id).await?;
        let answer = RTCSessionDescription::answer(sdp)?;
        link.pc().set_remote_description(answer).await?;
        self.flush_candidates(&link).await;
        Ok(())
    }

    /// Apply a trickled candidate now, or queue it on the link until the
    /// remote description lands
    pub async fn apply_candidate(
        &self,
        remote_id: &str,
        candidate: RTCIceCandidateInit,
    ) -> Result<()> {
        let link = self.require_link(remote_id).await?;
        if link.pc().remote_description().await.is_some() {
            link.pc().add_ice_candidate(candidate).await?;
        } else {
            link.queue_candidate(candidate);
        }
        Ok(())
    }

    /// ICE restart after `failed`: a fresh offer with new credentials,
    /// sent by the initiator only
    pub async fn restart_offer(&self, remote_id: &str) -> Result<String> {
        let link = self.require_link(remote_id).await?;
        let pc = link.pc();
        let options = RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        };
        let offer = pc.create_offer(Some(options)).await?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer).await?;
        info!("ICE restart offer created for {}", remote_id);
        Ok(sdp)
    }

    async fn flush_candidates(&self, link: &PeerLink) {
        for candidate in link.take_candidates() {
            if let Err(e) = link.pc().add_ice_candidate(candidate).await {
                warn!(
                    "failed to apply queued candidate for {}: {}",
                    link.remote_user_id(),
                    e
                );
            }
        }
    }

    /// Attach a screen track to every link: `replace_track` on an existing
    /// video sender where possible, `add_track` otherwise. A failing link
    /// is logged and skipped; the rest still get the track.
    ///
    /// Returns the remote ids that took the `add_track` path and therefore
    /// need a renegotiation offer.
    pub async fn attach_screen(&self, share: &ScreenShare) -> Vec<String> {
        let links: Vec<Arc<PeerLink>> = self.links.read().await.values().cloned().collect();
        let mut renegotiate = Vec::new();

        for link in links {
            let track: Arc<dyn TrackLocal + Send + Sync> = share.track();
            let mut replaced = false;
            for sender in link.pc().get_senders().await {
                let Some(existing) = sender.track().await else {
                    continue;
                };
                if existing.kind() == RTPCodecType::Video {
                    match sender.replace_track(Some(Arc::clone(&track))).await {
                        Ok(()) => {
                            replaced = true;
                            debug!(
                                "replaced video track with screen share for {}",
                                link.remote_user_id()
                            );
                        }
                        Err(e) => warn!(
                            "screen replace_track failed for {}: {}",
                            link.remote_user_id(),
                            e
                        ),
                    }
                    break;
                }
            }
            if !replaced {
                match link.pc().add_track(track).await {
                    Ok(_) => {
                        renegotiate.push(link.remote_user_id().to_string());
                        debug!("added screen track for {}", link.remote_user_id());
                    }
                    Err(e) => warn!(
                        "screen add_track failed for {}: {}",
                        link.remote_user_id(),
                        e
                    ),
                }
            }
        }
        renegotiate
    }

    /// Put the camera back (or stop sending) on every sender currently
    /// carrying the screen track
    pub async fn detach_screen(&self, share: &ScreenShare, camera: Option<Arc<dyn TrackLocal + Send + Sync>>) {
        let screen_id = share.track().id().to_string();
        let links: Vec<Arc<PeerLink>> = self.links.read().await.values().cloned().collect();

        for link in links {
            for sender in link.pc().get_senders().await {
                let Some(existing) = sender.track().await else {
                    continue;
                };
                if existing.id() == screen_id {
                    if let Err(e) = sender.replace_track(camera.clone()).await {
                        warn!(
                            "failed to restore video track for {}: {}",
                            link.remote_user_id(),
                            e
                        );
                    }
                }
            }
        }
    }

    pub async fn link(&self, remote_id: &str) -> Option<Arc<PeerLink>> {
        self.links.read().await.get(remote_id).cloned()
    }

    pub async fn contains(&self, remote_id: &str) -> bool {
        self.links.read().await.contains_key(remote_id)
    }

    async fn require_link(&self, remote_id: &str) -> Result<Arc<PeerLink>> {
        self.link(remote_id)
            .await
            .ok_or_else(|| Error::UnknownParticipant(remote_id.to_string()))
    }

    /// Remove and close the link to `remote_id`, if any
    pub async fn close(&self, remote_id: &str) -> Option<Arc<PeerLink>> {
        let removed = self.links.write().await.remove(remote_id);
        if let Some(link) = &removed {
            link.close().await;
        }
        removed
    }

    /// Close every link; used on disposal
    pub async fn close_all(&self) {
        let links: Vec<Arc<PeerLink>> = self.links.write().await.drain().map(|(_, l)| l).collect();
        for link in links {
            link.close().await;
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        self.links.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::Unspecified => None,
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaSource, SampleMediaSource};

    #[test]
    fn smaller_id_initiates() {
        assert!(is_initiator("u1", "u2"));
        assert!(!is_initiator("u2", "u1"));
        assert!(is_initiator("abc", "abd"));
        // degenerate: a participant never negotiates with itself
        assert!(!is_initiator("u1", "u1"));
    }

    fn manager() -> (PeerLinkManager, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = CallConfig::default().without_ice_servers();
        (PeerLinkManager::new(&config, tx).unwrap(), rx)
    }

    #[tokio::test]
    async fn ensure_peer_is_idempotent() {
        let (manager, _rx) = manager();
        let media = SampleMediaSource::new().capture().await.unwrap();

        let first = manager.ensure_peer("u2", &media, None).await.unwrap();
        let second = manager.ensure_peer("u2", &media, None).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn close_removes_exactly_once() {
        let (manager, _rx) = manager();
        let media = SampleMediaSource::new().capture().await.unwrap();
        manager.ensure_peer("u2", &media, None).await.unwrap();

        assert!(manager.close("u2").await.is_some());
        assert!(manager.close("u2").await.is_none());
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn begin_offer_creates_the_control_channel() {
        let (manager, mut rx) = manager();
        let media = SampleMediaSource::new().capture().await.unwrap();
        let link = manager.ensure_peer("u2", &media, None).await.unwrap();

        let sdp = manager.begin_offer("u2").await.unwrap();
        assert!(sdp.contains("v=0"));
        assert!(link.control().is_some());

        // the self-created channel is surfaced for the control bus
        let mut saw_channel = false;
        while let Ok(event) = rx.try_recv() {
            if let PeerEvent::DataChannel { remote, channel } = event {
                assert_eq!(remote, "u2");
                assert_eq!(channel.label(), CONTROL_CHANNEL_LABEL);
                saw_channel = true;
            }
        }
        assert!(saw_channel);
    }

    #[tokio::test]
    async fn early_candidates_are_queued_not_applied() {
        let (manager, _rx) = manager();
        let media = SampleMediaSource::new().capture().await.unwrap();
        let link = manager.ensure_peer("u2", &media, None).await.unwrap();

        manager
            .apply_candidate(
                "u2",
                RTCIceCandidateInit {
                    candidate: "candidate:1 1 udp 1 127.0.0.1 4242 typ host".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(link.take_candidates().len(), 1);
    }

    #[tokio::test]
    async fn screenshare_without_video_sender_uses_add_track() {
        let (manager, _rx) = manager();
        // audio-only capture: no outbound video sender exists
        let media = SampleMediaSource::audio_only().capture().await.unwrap();
        manager.ensure_peer("u2", &media, None).await.unwrap();

        let share = SampleMediaSource::new().capture_display().await.unwrap();
        let renegotiate = manager.attach_screen(&share).await;

        // the add_track path requires a renegotiation offer
        assert_eq!(renegotiate, vec!["u2".to_string()]);
    }

    #[tokio::test]
    async fn screenshare_with_video_sender_replaces() {
        let (manager, _rx) = manager();
        let media = SampleMediaSource::new().capture().await.unwrap();
        manager.ensure_peer("u2", &media, None).await.unwrap();

        let share = SampleMediaSource::new().capture_display().await.unwrap();
        let renegotiate = manager.attach_screen(&share).await;

        assert!(renegotiate.is_empty());
    }

    #[tokio::test]
    async fn operations_on_unknown_links_fail() {
        let (manager, _rx) = manager();
        assert!(matches!(
            manager.begin_offer("nobody").await,
            Err(Error::UnknownParticipant(_))
        ));
    }
}
