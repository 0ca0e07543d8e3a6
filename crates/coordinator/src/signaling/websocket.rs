//! WebSocket signaling client
//!
//! Speaks a small JSON frame protocol to a room relay: signal events,
//! persisted-state reads/writes, and a subscribe announcement. One
//! connection serves one session subscription; the read half runs in a pump
//! task that forwards events into the subscriber channel.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use meshcall_core::{
    Error as CoreError, Result as CoreResult, RoomState, SignalMessage, SignalingTransport,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// How long a persisted-state read waits for the relay to answer
const STATE_READ_TIMEOUT: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Frames exchanged with the relay
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "kebab-case")]
enum WireFrame {
    /// A signaling room event, relayed with its own addressing
    #[serde(rename_all = "camelCase")]
    Event { event: SignalMessage },
    /// Join a session's event stream as `user_id`
    #[serde(rename_all = "camelCase")]
    Subscribe { session_id: String, user_id: String },
    /// Overwrite the session snapshot
    #[serde(rename_all = "camelCase")]
    StateWrite { session_id: String, state: RoomState },
    /// Ask for the current session snapshot
    #[serde(rename_all = "camelCase")]
    StateRequest { session_id: String },
    /// Relay's answer to a state request
    #[serde(rename_all = "camelCase")]
    State {
        session_id: String,
        #[serde(default)]
        state: Option<RoomState>,
    },
}

/// A [`SignalingTransport`] over a WebSocket relay
pub struct WebSocketSignaling {
    write: Arc<Mutex<WsSink>>,
    subscriber: Arc<Mutex<Option<mpsc::UnboundedSender<SignalMessage>>>>,
    pending_state: Arc<Mutex<VecDeque<oneshot::Sender<Option<RoomState>>>>>,
    pump: JoinHandle<()>,
}

impl WebSocketSignaling {
    /// Connect to a relay, e.g. `ws://localhost:8080`
    pub async fn connect(url: &str) -> CoreResult<Self> {
        info!("connecting to signaling relay at {}", url);
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| CoreError::Transport(format!("connect to {url} failed: {e}")))?;
        let (write, mut read) = stream.split();

        let subscriber: Arc<Mutex<Option<mpsc::UnboundedSender<SignalMessage>>>> =
            Arc::new(Mutex::new(None));
        let pending_state: Arc<Mutex<VecDeque<oneshot::Sender<Option<RoomState>>>>> =
            Arc::new(Mutex::new(VecDeque::new()));

        let subscriber_for_pump = Arc::clone(&subscriber);
        let pending_for_pump = Arc::clone(&pending_state);
        let pump = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => {
                        info!("signaling relay closed the connection");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("signaling socket error: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<WireFrame>(&text) {
                    Ok(WireFrame::Event { event }) => {
                        let guard = subscriber_for_pump.lock().await;
                        if let Some(tx) = guard.as_ref() {
                            if tx.send(event).is_err() {
                                debug!("subscriber gone, discarding relayed event");
                            }
                        }
                    }
                    Ok(WireFrame::State { state, .. }) => {
                        if let Some(waiter) = pending_for_pump.lock().await.pop_front() {
                            let _ = waiter.send(state);
                        } else {
                            warn!("unsolicited state frame from relay");
                        }
                    }
                    Ok(other) => {
                        warn!("unexpected frame from relay: {:?}", other);
                    }
                    Err(e) => {
                        warn!("malformed frame from relay: {}", e);
                    }
                }
            }
        });

        Ok(Self {
            write: Arc::new(Mutex::new(write)),
            subscriber,
            pending_state,
            pump,
        })
    }

    async fn send_frame(&self, frame: &WireFrame) -> CoreResult<()> {
        let json = serde_json::to_string(frame)?;
        self.write
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .map_err(|e| CoreError::Transport(format!("websocket send failed: {e}")))
    }
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl SignalingTransport for WebSocketSignaling {
    async fn send_event(&self, message: SignalMessage) -> CoreResult<()> {
        self.send_frame(&WireFrame::Event { event: message }).await
    }

    async fn write_room_state(&self, session_id: &str, state: RoomState) -> CoreResult<()> {
        self.send_frame(&WireFrame::StateWrite {
            session_id: session_id.to_string(),
            state,
        })
        .await
    }

    async fn read_room_state(&self, session_id: &str) -> CoreResult<Option<RoomState>> {
        let (tx, rx) = oneshot::channel();
        self.pending_state.lock().await.push_back(tx);
        self.send_frame(&WireFrame::StateRequest {
            session_id: session_id.to_string(),
        })
        .await?;

        match tokio::time::timeout(STATE_READ_TIMEOUT, rx).await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(_)) => Err(CoreError::Transport(
                "relay dropped the state request".into(),
            )),
            Err(_) => Err(CoreError::Transport(format!(
                "state read timed out after {STATE_READ_TIMEOUT:?}"
            ))),
        }
    }

    async fn subscribe(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> CoreResult<mpsc::UnboundedReceiver<SignalMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.subscriber.lock().await = Some(tx);
        self.send_frame(&WireFrame::Subscribe {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
        })
        .await?;
        Ok(rx)
    }
}
