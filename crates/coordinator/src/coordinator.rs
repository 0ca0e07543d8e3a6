//! The group-call facade
//!
//! [`GroupCall`] is the object UI code consumes: an event emitter plus
//! imperative controls. It owns every peer link, the participant directory,
//! the control channel bus and the reconciliation scheduler, and drives all
//! of them from inbound signals, connection callbacks, data-channel gossip
//! and the debounce timer. Every async continuation checks the disposed
//! flag before producing further side effects.

use crate::channels::{BusEvent, ControlChannelBus, CONTROL_CHANNEL_LABEL};
use crate::config::CallConfig;
use crate::events::{CallEvent, CallEventKind, EventBus, Subscription};
use crate::media::{LocalMedia, MediaSource, RemoteStreams, ScreenShare};
use crate::peer::{is_initiator, PeerEvent, PeerLinkManager};
use crate::session::{DirectoryChange, ParticipantDirectory, ReconcileScheduler};
use crate::signaling::{PendingSignal, SignalRouter};
use crate::{Error, Result};
use meshcall_core::signal::LEAVE_REASON_KICK;
use meshcall_core::{
    ConnectionState, ControlMessage, CoWatchState, Participant, ParticipantDelta, Role, RoomState,
    SignalBody, SignalMessage, SignalingTransport,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

/// Options for [`GroupCall::create`]
#[derive(Debug, Clone)]
pub struct GroupCallOptions {
    pub session_id: String,
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: Role,
    pub config: CallConfig,
}

impl GroupCallOptions {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
            role: Role::Participant,
            config: CallConfig::default(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }

    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }
}

/// A live group-call session
///
/// Cheap to clone; all clones drive the same session. Dispose with
/// [`GroupCall::leave`].
#[derive(Clone)]
pub struct GroupCall {
    inner: Arc<CallInner>,
}

struct CallInner {
    session_id: String,
    local_user: String,
    nonce: String,
    transport: Arc<dyn SignalingTransport>,
    media_source: Arc<dyn MediaSource>,
    local_media: LocalMedia,
    directory: ParticipantDirectory,
    peers: PeerLinkManager,
    router: SignalRouter,
    bus: ControlChannelBus,
    events: EventBus,
    reconciler: ReconcileScheduler,
    cowatch: RwLock<CoWatchState>,
    screen: RwLock<Option<ScreenShare>>,
    remote_streams: RwLock<HashMap<String, RemoteStreams>>,
    disposed: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    /// Self-handle for continuations that must outlive the calling task
    weak_self: Weak<CallInner>,
}

impl GroupCall {
    /// Bootstrap a session.
    ///
    /// Local capture is acquired before any session state is constructed;
    /// failure there is fatal and nothing partial is returned. On success
    /// the local participant is seeded, the transport subscription starts,
    /// a `join` is broadcast, the persisted snapshot is merged, and the
    /// initial participants-changed event fires.
    pub async fn create(
        options: GroupCallOptions,
        transport: Arc<dyn SignalingTransport>,
        media_source: Arc<dyn MediaSource>,
    ) -> Result<Self> {
        let local_media = match media_source.capture().await {
            Ok(media) => media,
            Err(e) => {
                error!("local capture failed, aborting bootstrap: {}", e);
                return Err(e);
            }
        };

        let mut local = Participant::new(&options.user_id, &options.display_name)
            .with_role(options.role);
        local.avatar_url = options.avatar_url.clone();
        local.is_muted = !local_media.is_audio_enabled();
        local.is_video_muted = !local_media.is_video_enabled();
        local.connection_state = ConnectionState::Connected;

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let peers = PeerLinkManager::new(&options.config, peer_tx)?;

        let debounce = options.config.reconcile_debounce;
        let inner = Arc::new_cyclic(|weak: &Weak<CallInner>| {
            let flush_handle = weak.clone();
            let reconciler = ReconcileScheduler::new(debounce, move || {
                let weak = flush_handle.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.flush_room_state().await;
                    }
                }
            });

            CallInner {
                session_id: options.session_id.clone(),
                local_user: options.user_id.clone(),
                nonce: Uuid::new_v4().to_string(),
                transport: Arc::clone(&transport),
                media_source: Arc::clone(&media_source),
                local_media,
                directory: ParticipantDirectory::new(local),
                peers,
                router: SignalRouter::new(
                    &options.session_id,
                    &options.user_id,
                    options.config.max_pending_signals,
                ),
                bus: ControlChannelBus::new(bus_tx),
                events: EventBus::new(),
                reconciler,
                cowatch: RwLock::new(CoWatchState::default()),
                screen: RwLock::new(None),
                remote_streams: RwLock::new(HashMap::new()),
                disposed: AtomicBool::new(false),
                tasks: parking_lot::Mutex::new(Vec::new()),
                weak_self: weak.clone(),
            }
        });

        // subscribe before announcing so replies are not missed
        let signal_rx = transport
            .subscribe(&inner.session_id, &inner.local_user)
            .await?;
        inner.spawn_pumps(signal_rx, peer_rx, bus_rx);

        let announce = SignalBody::Join {
            display_name: options.display_name.clone(),
            avatar_url: options.avatar_url.clone(),
        };
        if let Err(e) = inner.send_signal(None, announce).await {
            inner.report_error(format!("join announcement failed: {e}"));
        }

        // full directory sync from the persisted snapshot
        match inner.transport.read_room_state(&inner.session_id).await {
            Ok(Some(state)) => inner.adopt_room_state(state).await,
            Ok(None) => debug!("no persisted state for session {}", inner.session_id),
            Err(e) => inner.report_error(format!("room state read failed: {e}")),
        }

        inner.emit_participants().await;
        info!(
            "{} joined session {} as {}",
            inner.local_user, inner.session_id, options.display_name
        );
        Ok(GroupCall { inner })
    }

    /// Subscribe to a facade event; returns the disposer handle
    pub fn on<F>(&self, kind: CallEventKind, handler: F) -> Subscription
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, handler)
    }

    /// Current roster, sorted by user id
    pub async fn participants(&self) -> Vec<Participant> {
        self.inner.directory.roster().await
    }

    /// The local capture stream
    pub fn local_stream(&self) -> LocalMedia {
        self.inner.local_media.clone()
    }

    /// Remote track handles for one participant, if its link is live
    pub async fn remote_streams(&self, user_id: &str) -> Option<RemoteStreams> {
        self.inner.remote_streams.read().await.get(user_id).cloned()
    }

    /// The shared co-watch state
    pub async fn co_watch_state(&self) -> CoWatchState {
        self.inner.cowatch.read().await.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn local_user_id(&self) -> &str {
        &self.inner.local_user
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Flip local audio enablement. Returns the new muted flag.
    pub async fn toggle_mute(&self) -> Result<bool> {
        self.inner.ensure_live()?;
        let muted = !self.inner.local_media.toggle_audio();
        self.inner.local_flag_changed(|d| d.with_muted(muted), |p| p.is_muted = muted).await;
        Ok(muted)
    }

    /// Flip local video enablement. Returns the new video-muted flag.
    pub async fn toggle_video(&self) -> Result<bool> {
        self.inner.ensure_live()?;
        let muted = !self.inner.local_media.toggle_video();
        self.inner
            .local_flag_changed(|d| d.with_video_muted(muted), |p| p.is_video_muted = muted)
            .await;
        Ok(muted)
    }

    /// Start or stop screensharing. Returns whether a share is now active.
    pub async fn toggle_screenshare(&self) -> Result<bool> {
        self.inner.ensure_live()?;
        if self.inner.screen.read().await.is_some() {
            self.inner.stop_screenshare().await;
            return Ok(false);
        }

        let share = match self.inner.media_source.capture_display().await {
            Ok(share) => share,
            Err(e) => {
                self.inner.report_error(format!("display capture failed: {e}"));
                return Err(e);
            }
        };

        let renegotiate = self.inner.peers.attach_screen(&share).await;
        *self.inner.screen.write().await = Some(share.clone());

        // auto-stop when the capture ends from the outside
        let weak = Arc::downgrade(&self.inner);
        let watcher_share = share.clone();
        let watcher = tokio::spawn(async move {
            watcher_share.wait_ended().await;
            if let Some(inner) = weak.upgrade() {
                if !inner.is_disposed() && inner.screen.read().await.is_some() {
                    info!("screen capture ended, stopping share");
                    inner.stop_screenshare().await;
                }
            }
        });
        self.inner.tasks.lock().push(watcher);

        // links that had no video sender need a renegotiation offer
        for remote in renegotiate {
            self.inner.renegotiate(&remote).await;
        }

        self.inner
            .directory
            .update(&self.inner.local_user, |p| p.is_screensharing = true)
            .await;
        self.inner
            .bus
            .broadcast(&ControlMessage::ScreenshareToggle {
                user_id: self.inner.local_user.clone(),
                active: true,
            })
            .await;
        self.inner.events.emit(CallEvent::ScreenshareChanged {
            user_id: self.inner.local_user.clone(),
            active: true,
        });
        self.inner.roster_changed().await;
        Ok(true)
    }

    /// Flip or overwrite the shared co-watch state.
    ///
    /// With a URL the state is (re)started pointing at it; without one an
    /// active state stops and an inactive one starts bare.
    pub async fn toggle_co_watch(&self, url: Option<String>) -> Result<CoWatchState> {
        self.inner.ensure_live()?;
        let next = {
            let current = self.inner.cowatch.read().await.clone();
            if current.active && url.is_none() {
                CoWatchState::stopped()
            } else {
                CoWatchState::started(url, &self.inner.local_user)
            }
        };
        *self.inner.cowatch.write().await = next.clone();
        let active = next.active;
        self.inner
            .directory
            .update(&self.inner.local_user, |p| p.is_co_watching = active)
            .await;

        // the shared value is persisted immediately, not debounced
        self.inner.flush_room_state().await;
        self.inner
            .bus
            .broadcast(&ControlMessage::CoWatchToggle(next.clone()))
            .await;
        self.inner.events.emit(CallEvent::CoWatchChanged(next.clone()));
        self.inner.roster_changed().await;
        Ok(next)
    }

    /// Promote a participant to moderator and broadcast the request
    pub async fn promote_participant(&self, user_id: &str) -> Result<()> {
        self.inner
            .request_remote_change(user_id, |d| d.with_role(Role::Moderator), |p| {
                p.role = Role::Moderator
            })
            .await
    }

    /// Request a mute state for a remote participant.
    ///
    /// Updates the local view and gossips the request; the remote client
    /// honors it locally. Nothing here reaches into remote hardware.
    pub async fn set_participant_muted(&self, user_id: &str, muted: bool) -> Result<()> {
        self.inner
            .request_remote_change(user_id, |d| d.with_muted(muted), |p| p.is_muted = muted)
            .await
    }

    /// Request a video-mute state for a remote participant
    pub async fn set_participant_video_muted(&self, user_id: &str, muted: bool) -> Result<()> {
        self.inner
            .request_remote_change(
                user_id,
                |d| d.with_video_muted(muted),
                |p| p.is_video_muted = muted,
            )
            .await
    }

    /// Remove a participant: local removal, link teardown, and a directed
    /// `leave` with reason `"kick"`
    pub async fn kick_participant(&self, user_id: &str) -> Result<()> {
        self.inner.ensure_live()?;
        if user_id == self.inner.local_user {
            return Err(Error::SignalingError(
                "cannot kick the local participant".into(),
            ));
        }
        if self.inner.directory.remove(user_id).await.is_none() {
            return Err(Error::UnknownParticipant(user_id.to_string()));
        }
        self.inner.drop_peer_state(user_id).await;

        let body = SignalBody::Leave {
            reason: Some(LEAVE_REASON_KICK.to_string()),
        };
        if let Err(e) = self.inner.send_signal(Some(user_id), body).await {
            self.inner
                .report_error(format!("kick signal to {user_id} failed: {e}"));
        }
        info!("kicked {} from session {}", user_id, self.inner.session_id);
        self.inner.roster_changed().await;
        Ok(())
    }

    /// Dispose the session. Idempotent; a second call is a no-op.
    pub async fn leave(&self) -> Result<()> {
        self.inner.leave_internal().await
    }
}

impl CallInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn spawn_pumps(
        &self,
        mut signal_rx: mpsc::UnboundedReceiver<SignalMessage>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
        mut bus_rx: mpsc::UnboundedReceiver<BusEvent>,
    ) {
        let weak = self.weak_self.clone();
        let signals = tokio::spawn(async move {
            while let Some(message) = signal_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if inner.is_disposed() {
                    break;
                }
                inner.handle_signal(message).await;
            }
        });

        let weak = self.weak_self.clone();
        let peer_events = tokio::spawn(async move {
            while let Some(event) = peer_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if inner.is_disposed() {
                    break;
                }
                inner.handle_peer_event(event).await;
            }
        });

        let weak = self.weak_self.clone();
        let bus_events = tokio::spawn(async move {
            while let Some(event) = bus_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if inner.is_disposed() {
                    break;
                }
                inner.handle_bus_event(event).await;
            }
        });

        self.tasks.lock().extend([signals, peer_events, bus_events]);
    }

    // ------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------

    async fn send_signal(&self, target: Option<&str>, body: SignalBody) -> Result<()> {
        let message = match target {
            Some(target) => SignalMessage::directed(
                &self.session_id,
                &self.local_user,
                target,
                body,
                &self.nonce,
            ),
            None => SignalMessage::broadcast(&self.session_id, &self.local_user, body, &self.nonce),
        };
        self.transport.send_event(message).await?;
        Ok(())
    }

    async fn handle_signal(&self, message: SignalMessage) {
        if !self.router.accepts(&message) {
            return;
        }
        let sender = message.sender.clone();
        let targeted = message.target.is_some();

        match message.body {
            SignalBody::Join {
                display_name,
                avatar_url,
            } => {
                self.handle_join(&sender, display_name, avatar_url, !targeted)
                    .await;
            }
            // an offer may create the link: negotiation starts on the
            // non-initiator when the initiator's offer arrives
            SignalBody::Offer { sdp } => {
                if !self.peers.contains(&sender).await {
                    if let Err(e) = self.ensure_link(&sender).await {
                        self.report_error(format!("link to {sender} failed: {e}"));
                        return;
                    }
                }
                self.process_offer(&sender, sdp).await;
            }
            body => {
                if self.peers.contains(&sender).await {
                    self.process_signal(&sender, body, targeted).await;
                } else {
                    self.router
                        .buffer(&sender, PendingSignal { body, targeted })
                        .await;
                }
            }
        }
    }

    async fn handle_join(
        &self,
        sender: &str,
        display_name: String,
        avatar_url: Option<String>,
        broadcast: bool,
    ) {
        let mut entry = Participant::new(sender, display_name.clone());
        entry.avatar_url = avatar_url.clone();
        if !self.directory.insert_if_absent(entry).await {
            self.directory
                .update(sender, |p| {
                    p.display_name = display_name;
                    p.avatar_url = avatar_url;
                })
                .await;
        }
        self.roster_changed().await;

        if self.peers.contains(sender).await {
            // link already negotiating; nothing more to do
            return;
        }

        if is_initiator(&self.local_user, sender) {
            self.start_negotiation(sender).await;
        } else if broadcast {
            // answer an unknown broadcast join with a directed one so the
            // smaller id observes a join and fires the single offer
            let local = self.directory.get(&self.local_user).await;
            let body = SignalBody::Join {
                display_name: local
                    .as_ref()
                    .map(|p| p.display_name.clone())
                    .unwrap_or_else(|| self.local_user.clone()),
                avatar_url: local.and_then(|p| p.avatar_url),
            };
            if let Err(e) = self.send_signal(Some(sender), body).await {
                self.report_error(format!("join echo to {sender} failed: {e}"));
            }
        }
    }

    /// Initiator side: create the link, replay anything buffered, offer
    async fn start_negotiation(&self, remote: &str) {
        if let Err(e) = self.ensure_link(remote).await {
            self.report_error(format!("link to {remote} failed: {e}"));
            return;
        }
        match self.peers.begin_offer(remote).await {
            Ok(sdp) => {
                if let Err(e) = self.send_signal(Some(remote), SignalBody::Offer { sdp }).await {
                    self.report_error(format!("offer to {remote} failed: {e}"));
                }
            }
            Err(e) => self.report_error(format!("offer creation for {remote} failed: {e}")),
        }
    }

    /// Create the peer link if absent and replay buffered signals in order
    async fn ensure_link(&self, remote: &str) -> Result<()> {
        let screen = self.screen.read().await.clone();
        self.peers
            .ensure_peer(remote, &self.local_media, screen.as_ref())
            .await?;
        self.directory
            .update(remote, |p| p.connection_state = ConnectionState::Connecting)
            .await;
        for pending in self.router.drain(remote).await {
            self.process_signal(remote, pending.body, pending.targeted)
                .await;
        }
        Ok(())
    }

    async fn process_offer(&self, sender: &str, sdp: String) {
        match self.peers.accept_offer(sender, sdp).await {
            Ok(answer) => {
                if let Err(e) = self
                    .send_signal(Some(sender), SignalBody::Answer { sdp: answer })
                    .await
                {
                    self.report_error(format!("answer to {sender} failed: {e}"));
                }
            }
            Err(e) => self.report_error(format!("offer from {sender} failed: {e}")),
        }
    }

    async fn process_signal(&self, sender: &str, body: SignalBody, targeted: bool) {
        match body {
            SignalBody::Join { .. } => {
                debug!("join from {} is handled before buffering", sender);
            }
            SignalBody::Offer { sdp } => self.process_offer(sender, sdp).await,
            SignalBody::Answer { sdp } => {
                if let Err(e) = self.peers.accept_answer(sender, sdp).await {
                    self.report_error(format!("answer from {sender} failed: {e}"));
                }
            }
            SignalBody::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    username_fragment: None,
                };
                if let Err(e) = self.peers.apply_candidate(sender, init).await {
                    self.report_error(format!("candidate from {sender} failed: {e}"));
                }
            }
            SignalBody::Leave { reason } => {
                let kicked = targeted && reason.as_deref() == Some(LEAVE_REASON_KICK);
                if kicked {
                    info!("kicked from session {} by {}", self.session_id, sender);
                    // tear down off this pump task; leave aborts it
                    if let Some(inner) = self.weak_self.upgrade() {
                        tokio::spawn(async move {
                            let _ = inner.leave_internal().await;
                        });
                    }
                    return;
                }
                debug!("{} left session {} ({:?})", sender, self.session_id, reason);
                self.directory.remove(sender).await;
                self.drop_peer_state(sender).await;
                self.roster_changed().await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection callbacks
    // ------------------------------------------------------------------

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate { remote, candidate } => {
                let body = SignalBody::IceCandidate {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                };
                if let Err(e) = self.send_signal(Some(&remote), body).await {
                    self.report_error(format!("candidate to {remote} failed: {e}"));
                }
            }
            PeerEvent::Track { remote, track } => {
                let kind = track.kind();
                {
                    let mut streams = self.remote_streams.write().await;
                    let entry = streams.entry(remote.clone()).or_default();
                    match kind {
                        RTPCodecType::Audio => entry.audio = Some(track),
                        RTPCodecType::Video => entry.video = Some(track),
                        RTPCodecType::Unspecified => {}
                    }
                }
                // an arriving track proves the corresponding mute is off
                self.directory
                    .update(&remote, |p| match kind {
                        RTPCodecType::Audio => p.is_muted = false,
                        RTPCodecType::Video => p.is_video_muted = false,
                        RTPCodecType::Unspecified => {}
                    })
                    .await;
                self.roster_changed().await;
            }
            PeerEvent::StateChanged { remote, state } => {
                if let Some(link) = self.peers.link(&remote).await {
                    if link.state() != ConnectionState::Closed {
                        link.set_state(state);
                    }
                }
                self.directory
                    .update(&remote, |p| p.connection_state = state)
                    .await;
                if state.is_degraded() {
                    self.remote_streams.write().await.remove(&remote);
                }
                if state == ConnectionState::Failed {
                    self.recover_failed_link(&remote).await;
                }
                self.roster_changed().await;
            }
            PeerEvent::DataChannel { remote, channel } => {
                if channel.label() != CONTROL_CHANNEL_LABEL {
                    debug!(
                        "ignoring data channel '{}' from {}",
                        channel.label(),
                        remote
                    );
                    return;
                }
                if let Some(link) = self.peers.link(&remote).await {
                    link.set_control(Arc::clone(&channel));
                }
                self.bus.attach(&remote, channel).await;
            }
        }
    }

    /// ICE failure recovery: the initiator restarts, the other side keeps
    /// the link and waits for the restart offer
    async fn recover_failed_link(&self, remote: &str) {
        if !is_initiator(&self.local_user, remote) {
            info!(
                "link to {} failed; waiting for initiator's ICE restart",
                remote
            );
            return;
        }
        info!("link to {} failed; attempting ICE restart", remote);
        match self.peers.restart_offer(remote).await {
            Ok(sdp) => {
                if let Err(e) = self.send_signal(Some(remote), SignalBody::Offer { sdp }).await {
                    self.report_error(format!("restart offer to {remote} failed: {e}"));
                }
            }
            Err(e) => self.report_error(format!("ICE restart for {remote} failed: {e}")),
        }
    }

    /// Renegotiate an established link after a track addition
    async fn renegotiate(&self, remote: &str) {
        match self.peers.begin_offer(remote).await {
            Ok(sdp) => {
                if let Err(e) = self.send_signal(Some(remote), SignalBody::Offer { sdp }).await {
                    self.report_error(format!("renegotiation offer to {remote} failed: {e}"));
                }
            }
            Err(e) => self.report_error(format!("renegotiation for {remote} failed: {e}")),
        }
    }

    // ------------------------------------------------------------------
    // Control-channel gossip
    // ------------------------------------------------------------------

    async fn handle_bus_event(&self, event: BusEvent) {
        match event {
            BusEvent::Open { remote } => {
                // catch-up gossip: a newly connected peer gets the full
                // directory immediately instead of waiting for a debounce.
                // Its own entry is left out so a stale view of the peer
                // cannot overwrite its self-state.
                let participants: Vec<ParticipantDelta> = self
                    .directory
                    .snapshot_deltas()
                    .await
                    .into_iter()
                    .filter(|d| d.user_id != remote)
                    .collect();
                let snapshot = ControlMessage::ParticipantsSync { participants };
                if let Err(e) = self.bus.send_to(&remote, &snapshot).await {
                    warn!("catch-up snapshot to {} failed: {}", remote, e);
                }
            }
            BusEvent::Message { remote, message } => {
                self.apply_control(&remote, message).await;
            }
            BusEvent::Closed { remote } => {
                debug!("control channel to {} closed", remote);
            }
        }
    }

    async fn apply_control(&self, from: &str, message: ControlMessage) {
        match message {
            ControlMessage::ParticipantsSync { participants } => {
                let mut changed = false;
                for delta in participants {
                    if delta.user_id == self.local_user {
                        // honor requested mute changes locally
                        if let Some(muted) = delta.is_muted {
                            self.local_media.set_audio_enabled(!muted);
                        }
                        if let Some(muted) = delta.is_video_muted {
                            self.local_media.set_video_enabled(!muted);
                        }
                    }
                    match self.directory.merge_delta(&delta).await {
                        DirectoryChange::Updated => changed = true,
                        DirectoryChange::Removed => {
                            self.drop_peer_state(&delta.user_id).await;
                            changed = true;
                        }
                        DirectoryChange::Unchanged => {}
                    }
                }
                if changed {
                    self.roster_changed().await;
                }
            }
            ControlMessage::CoWatchToggle(state) => {
                *self.cowatch.write().await = state.clone();
                let active = state.active;
                self.directory
                    .update(from, |p| p.is_co_watching = active)
                    .await;
                self.events.emit(CallEvent::CoWatchChanged(state));
                self.roster_changed().await;
            }
            ControlMessage::ScreenshareToggle { user_id, active } => {
                self.directory
                    .update(&user_id, |p| p.is_screensharing = active)
                    .await;
                self.events
                    .emit(CallEvent::ScreenshareChanged { user_id, active });
                self.roster_changed().await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    /// Local one-field change: directory update, one-field gossip delta,
    /// debounced reconcile, roster event
    async fn local_flag_changed<D, M>(&self, delta: D, mutate: M)
    where
        D: FnOnce(ParticipantDelta) -> ParticipantDelta,
        M: FnOnce(&mut Participant),
    {
        self.directory.update(&self.local_user, mutate).await;
        let delta = delta(ParticipantDelta::new(&self.local_user));
        self.bus
            .broadcast(&ControlMessage::single_delta(delta))
            .await;
        self.roster_changed().await;
    }

    /// Moderation request against a remote participant: update the local
    /// view and gossip the requested change
    async fn request_remote_change<D, M>(&self, user_id: &str, delta: D, mutate: M) -> Result<()>
    where
        D: FnOnce(ParticipantDelta) -> ParticipantDelta,
        M: FnOnce(&mut Participant),
    {
        self.ensure_live()?;
        if !self.directory.update(user_id, mutate).await {
            return Err(Error::UnknownParticipant(user_id.to_string()));
        }
        let delta = delta(ParticipantDelta::new(user_id));
        self.bus
            .broadcast(&ControlMessage::single_delta(delta))
            .await;
        self.roster_changed().await;
        Ok(())
    }

    async fn stop_screenshare(&self) {
        let Some(share) = self.screen.write().await.take() else {
            return;
        };
        share.notify_ended();
        let camera = self
            .local_media
            .video_track()
            .map(|t| t as Arc<dyn TrackLocal + Send + Sync>);
        self.peers.detach_screen(&share, camera).await;

        self.directory
            .update(&self.local_user, |p| p.is_screensharing = false)
            .await;
        self.bus
            .broadcast(&ControlMessage::ScreenshareToggle {
                user_id: self.local_user.clone(),
                active: false,
            })
            .await;
        self.events.emit(CallEvent::ScreenshareChanged {
            user_id: self.local_user.clone(),
            active: false,
        });
        self.roster_changed().await;
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    async fn adopt_room_state(&self, state: RoomState) {
        for mut participant in state.participants {
            if participant.user_id == self.local_user {
                continue;
            }
            // snapshot state is historical; links re-form via signaling
            participant.connection_state = ConnectionState::New;
            self.directory.insert_if_absent(participant).await;
        }
        if state.cowatch != CoWatchState::default() {
            *self.cowatch.write().await = state.cowatch.clone();
            self.events.emit(CallEvent::CoWatchChanged(state.cowatch));
        }
    }

    async fn flush_room_state(&self) {
        if self.is_disposed() {
            return;
        }
        let state = RoomState::new(
            self.directory.roster().await,
            self.cowatch.read().await.clone(),
        );
        debug!(
            "persisting snapshot for {} ({} participants)",
            self.session_id,
            state.participants.len()
        );
        if let Err(e) = self.transport.write_room_state(&self.session_id, state).await {
            self.report_error(format!("snapshot write failed: {e}"));
        }
    }

    /// Close the link, drop channel and stream references for one peer
    async fn drop_peer_state(&self, user_id: &str) {
        self.peers.close(user_id).await;
        self.bus.detach(user_id).await;
        self.remote_streams.write().await.remove(user_id);
    }

    async fn emit_participants(&self) {
        self.events
            .emit(CallEvent::ParticipantsChanged(self.directory.roster().await));
    }

    /// Roster mutated: emit the event and schedule reconciliation
    async fn roster_changed(&self) {
        self.emit_participants().await;
        self.reconciler.schedule();
    }

    fn report_error(&self, message: String) {
        error!("{}", message);
        self.events.emit(CallEvent::Error { message });
    }

    async fn leave_internal(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("{} leaving session {}", self.local_user, self.session_id);

        // stop consuming the transport first
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.reconciler.cancel();

        // announce while the transport and channels are still up
        if let Err(e) = self.send_signal(None, SignalBody::Leave { reason: None }).await {
            warn!("leave announcement failed: {}", e);
        }
        let farewell =
            ControlMessage::single_delta(ParticipantDelta::new(&self.local_user).with_left());
        self.bus.broadcast(&farewell).await;

        // stop shared media
        if let Some(share) = self.screen.write().await.take() {
            share.notify_ended();
        }
        self.local_media.stop();

        // symmetric teardown of every link and channel
        self.peers.close_all().await;
        self.bus.clear().await;
        self.router.clear().await;
        self.remote_streams.write().await.clear();
        self.directory.clear().await;

        self.events.emit(CallEvent::Disposed);
        Ok(())
    }
}

impl std::fmt::Debug for GroupCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCall")
            .field("session_id", &self.inner.session_id)
            .field("local_user", &self.inner.local_user)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{SampleMediaSource, UnavailableMediaSource};
    use crate::signaling::MemorySignalingHub;
    use meshcall_core::SignalKind;
    use std::sync::atomic::AtomicUsize;

    fn options(user: &str) -> GroupCallOptions {
        GroupCallOptions::new("s1", user, user.to_uppercase())
            .with_config(CallConfig::default().without_ice_servers())
    }

    async fn call(hub: &MemorySignalingHub, user: &str) -> GroupCall {
        GroupCall::create(
            options(user),
            Arc::new(hub.transport()),
            Arc::new(SampleMediaSource::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_seeds_local_participant_and_announces() {
        let hub = MemorySignalingHub::new();
        let call = call(&hub, "u1").await;

        let roster = call.participants().await;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].user_id, "u1");
        assert!(!roster[0].is_muted);

        let joins = hub.sent_of_kind(SignalKind::Join).await;
        assert_eq!(joins.len(), 1);
        assert!(joins[0].is_broadcast());

        call.leave().await.unwrap();
    }

    #[tokio::test]
    async fn capture_failure_is_fatal_and_announces_nothing() {
        let hub = MemorySignalingHub::new();
        let result = GroupCall::create(
            options("u1"),
            Arc::new(hub.transport()),
            Arc::new(UnavailableMediaSource),
        )
        .await;

        assert!(matches!(result, Err(Error::MediaError(_))));
        assert!(hub.sent().await.is_empty());
    }

    #[tokio::test]
    async fn toggle_mute_twice_restores_enablement_and_emits_twice() {
        let hub = MemorySignalingHub::new();
        let call = call(&hub, "u1").await;

        let rosters = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&rosters);
        let _sub = call.on(CallEventKind::ParticipantsChanged, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(call.toggle_mute().await.unwrap());
        assert!(!call.local_stream().is_audio_enabled());
        assert!(!call.toggle_mute().await.unwrap());
        assert!(call.local_stream().is_audio_enabled());

        assert_eq!(rosters.load(Ordering::SeqCst), 2);
        call.leave().await.unwrap();
    }

    #[tokio::test]
    async fn double_leave_is_a_noop() {
        let hub = MemorySignalingHub::new();
        let call = call(&hub, "u1").await;

        let disposals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disposals);
        let _sub = call.on(CallEventKind::Disposed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        call.leave().await.unwrap();
        call.leave().await.unwrap();

        assert!(call.is_disposed());
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
        assert_eq!(hub.sent_of_kind(SignalKind::Leave).await.len(), 1);
    }

    #[tokio::test]
    async fn operations_after_leave_fail_with_disposed() {
        let hub = MemorySignalingHub::new();
        let call = call(&hub, "u1").await;
        call.leave().await.unwrap();

        assert!(matches!(call.toggle_mute().await, Err(Error::Disposed)));
        assert!(matches!(
            call.toggle_co_watch(None).await,
            Err(Error::Disposed)
        ));
    }

    #[tokio::test]
    async fn kick_requires_a_known_participant() {
        let hub = MemorySignalingHub::new();
        let call = call(&hub, "u1").await;

        assert!(matches!(
            call.kick_participant("ghost").await,
            Err(Error::UnknownParticipant(_))
        ));
        assert!(matches!(
            call.kick_participant("u1").await,
            Err(Error::SignalingError(_))
        ));
        call.leave().await.unwrap();
    }

    #[tokio::test]
    async fn co_watch_toggle_persists_immediately() {
        let hub = MemorySignalingHub::new();
        let call = call(&hub, "u1").await;

        let state = call
            .toggle_co_watch(Some("https://example.com/movie".into()))
            .await
            .unwrap();
        assert!(state.active);
        assert_eq!(state.started_by.as_deref(), Some("u1"));

        let persisted = hub.state("s1").await.unwrap();
        assert!(persisted.cowatch.active);
        assert_eq!(
            persisted.cowatch.url.as_deref(),
            Some("https://example.com/movie")
        );

        let stopped = call.toggle_co_watch(None).await.unwrap();
        assert!(!stopped.active);
        call.leave().await.unwrap();
    }

    #[tokio::test]
    async fn joining_an_existing_snapshot_merges_the_roster() {
        let hub = MemorySignalingHub::new();
        let transport = hub.transport();

        let mut ghost = Participant::new("u9", "Ghost");
        ghost.connection_state = ConnectionState::Connected;
        transport
            .write_room_state("s1", RoomState::new(vec![ghost], CoWatchState::default()))
            .await
            .unwrap();

        let call = call(&hub, "u1").await;
        let roster = call.participants().await;
        assert_eq!(roster.len(), 2);
        // historical connection state is not trusted
        let ghost = roster.iter().find(|p| p.user_id == "u9").unwrap();
        assert_eq!(ghost.connection_state, ConnectionState::New);
        call.leave().await.unwrap();
    }
}
