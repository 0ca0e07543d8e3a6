//! Control channel bus
//!
//! Tracks the "control" data channel of every peer link and fans
//! application-state gossip out over the open ones. Inbound frames are
//! parsed here; malformed payloads are logged and dropped without touching
//! the channel or its siblings.

use crate::{Error, Result};
use bytes::Bytes;
use meshcall_core::ControlMessage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Label of the per-link control channel
pub const CONTROL_CHANNEL_LABEL: &str = "control";

/// Events surfaced from data-channel callbacks into the coordinator loop
#[derive(Debug)]
pub enum BusEvent {
    /// The channel to `remote` opened; time for catch-up gossip
    Open { remote: String },
    /// A parsed control message arrived from `remote`
    Message {
        remote: String,
        message: ControlMessage,
    },
    /// The channel to `remote` closed
    Closed { remote: String },
}

/// Per-session control channel registry
pub struct ControlChannelBus {
    channels: RwLock<HashMap<String, Arc<RTCDataChannel>>>,
    events: mpsc::UnboundedSender<BusEvent>,
}

impl ControlChannelBus {
    pub fn new(events: mpsc::UnboundedSender<BusEvent>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Adopt a channel for `remote` and wire its callbacks.
    ///
    /// Both self-created and inbound channels land here; a replacement for
    /// the same remote overwrites the previous registration.
    pub async fn attach(&self, remote: &str, channel: Arc<RTCDataChannel>) {
        debug!("adopting control channel for {}", remote);

        let remote_for_open = remote.to_string();
        let events = self.events.clone();
        channel.on_open(Box::new(move || {
            let remote = remote_for_open.clone();
            let events = events.clone();
            Box::pin(async move {
                debug!("control channel to {} open", remote);
                let _ = events.send(BusEvent::Open { remote });
            })
        }));

        let remote_for_msg = remote.to_string();
        let events = self.events.clone();
        channel.on_message(Box::new(move |msg| {
            let remote = remote_for_msg.clone();
            let events = events.clone();
            let data = msg.data.to_vec();
            Box::pin(async move {
                match ControlMessage::from_bytes(&data) {
                    Ok(message) => {
                        trace!("{} from {}", message.kind_name(), remote);
                        let _ = events.send(BusEvent::Message { remote, message });
                    }
                    Err(e) => {
                        // swallowed per-channel; siblings are unaffected
                        warn!("malformed control payload from {}: {}", remote, e);
                    }
                }
            })
        }));

        let remote_for_close = remote.to_string();
        let events = self.events.clone();
        channel.on_close(Box::new(move || {
            let remote = remote_for_close.clone();
            let events = events.clone();
            Box::pin(async move {
                debug!("control channel to {} closed", remote);
                let _ = events.send(BusEvent::Closed { remote });
            })
        }));

        // the channel may have opened before the handlers landed; a second
        // Open for the same remote only repeats the idempotent catch-up
        if channel.ready_state() == RTCDataChannelState::Open {
            let _ = self.events.send(BusEvent::Open {
                remote: remote.to_string(),
            });
        }

        self.channels
            .write()
            .await
            .insert(remote.to_string(), channel);
    }

    /// Send one message to one peer; fails if the channel is absent or not
    /// open yet
    pub async fn send_to(&self, remote: &str, message: &ControlMessage) -> Result<()> {
        let channel = self
            .channels
            .read()
            .await
            .get(remote)
            .cloned()
            .ok_or_else(|| {
                Error::DataChannelError(format!("no control channel for {remote}"))
            })?;

        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(Error::DataChannelError(format!(
                "control channel to {remote} is not open ({:?})",
                channel.ready_state()
            )));
        }

        let bytes = message.to_bytes()?;
        channel
            .send(&Bytes::from(bytes))
            .await
            .map_err(|e| Error::DataChannelError(format!("send to {remote} failed: {e}")))?;
        Ok(())
    }

    /// Gossip a message over every open channel; per-channel failures are
    /// logged and skipped. Returns how many peers received it.
    pub async fn broadcast(&self, message: &ControlMessage) -> usize {
        let channels: Vec<(String, Arc<RTCDataChannel>)> = self
            .channels
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let bytes = match message.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!("refusing to broadcast unserializable message: {}", e);
                return 0;
            }
        };

        let mut sent = 0;
        for (remote, channel) in channels {
            if channel.ready_state() != RTCDataChannelState::Open {
                trace!("skipping {} (channel not open)", remote);
                continue;
            }
            match channel.send(&bytes).await {
                Ok(_) => sent += 1,
                Err(e) => warn!("control broadcast to {} failed: {}", remote, e),
            }
        }
        trace!("{} gossiped to {} peer(s)", message.kind_name(), sent);
        sent
    }

    /// Forget the channel for `remote`; closing is the link's job
    pub async fn detach(&self, remote: &str) {
        self.channels.write().await.remove(remote);
    }

    /// Forget every channel; used on disposal
    pub async fn clear(&self) {
        self.channels.write().await.clear();
    }

    /// Whether the channel to `remote` is registered and open
    pub async fn is_open(&self, remote: &str) -> bool {
        self.channels
            .read()
            .await
            .get(remote)
            .map(|c| c.ready_state() == RTCDataChannelState::Open)
            .unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcall_core::ParticipantDelta;
    use webrtc::api::APIBuilder;

    async fn unopened_channel() -> Arc<RTCDataChannel> {
        let api = APIBuilder::new().build();
        let pc = api
            .new_peer_connection(Default::default())
            .await
            .unwrap();
        pc.create_data_channel(CONTROL_CHANNEL_LABEL, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn send_to_unopened_channel_fails_cleanly() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let bus = ControlChannelBus::new(tx);
        bus.attach("u2", unopened_channel().await).await;

        let message = ControlMessage::single_delta(ParticipantDelta::new("u1").with_muted(true));
        let err = bus.send_to("u2", &message).await.unwrap_err();
        assert!(matches!(err, Error::DataChannelError(_)));
    }

    #[tokio::test]
    async fn broadcast_skips_unopened_channels() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let bus = ControlChannelBus::new(tx);
        bus.attach("u2", unopened_channel().await).await;
        bus.attach("u3", unopened_channel().await).await;

        let message = ControlMessage::single_delta(ParticipantDelta::new("u1").with_muted(true));
        assert_eq!(bus.broadcast(&message).await, 0);
        assert_eq!(bus.len().await, 2);
    }

    #[tokio::test]
    async fn detach_forgets_the_channel() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let bus = ControlChannelBus::new(tx);
        bus.attach("u2", unopened_channel().await).await;
        assert_eq!(bus.len().await, 1);

        bus.detach("u2").await;
        assert!(bus.is_empty().await);

        let message = ControlMessage::single_delta(ParticipantDelta::new("u1"));
        assert!(bus.send_to("u2", &message).await.is_err());
    }
}
