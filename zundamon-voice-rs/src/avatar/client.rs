//! WebSocket client side of the avatar relay link.
//!
//! Sends are fire-and-forget: while the link is not connected every cue is
//! dropped, and a full queue drops instead of waiting.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{AvatarLink, ConnectionState, RelayMessage};
use crate::config::AvatarConfig;
use crate::emotion::EmotionTag;

const QUEUE_DEPTH: usize = 64;

pub struct RelayClient {
    tx: mpsc::Sender<RelayMessage>,
    state: watch::Receiver<ConnectionState>,
}

impl RelayClient {
    /// Start the connection task. It reconnects on its own until `cancel`.
    pub fn spawn(config: &AvatarConfig, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let url = config.relay_url.clone();
        let reconnect = Duration::from_secs(config.reconnect_secs.max(1));
        tokio::spawn(run(url, reconnect, rx, state_tx, cancel));
        Self { tx, state }
    }

    /// Spawn only when the avatar is enabled in config.
    pub fn start(config: &AvatarConfig, cancel: CancellationToken) -> Option<Self> {
        if !config.enabled {
            info!("Avatar disabled, not connecting to the relay");
            return None;
        }
        Some(Self::spawn(config, cancel))
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn push(&self, msg: RelayMessage) {
        if *self.state.borrow() != ConnectionState::Connected {
            return;
        }
        if let Err(e) = self.tx.try_send(msg) {
            debug!("Relay message dropped: {e}");
        }
    }
}

impl AvatarLink for RelayClient {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_mouth(&self, openness: f32) {
        self.push(RelayMessage::mouth(openness));
    }

    fn set_arm_pose(&self, playing: bool) {
        self.push(RelayMessage::SetArmPose {
            is_playing: playing,
        });
    }

    fn set_emotion(&self, tag: EmotionTag) {
        self.push(RelayMessage::emotion(tag));
    }

    fn set_gesture(&self, tag: EmotionTag) {
        self.push(RelayMessage::gesture(tag));
    }
}

async fn run(
    url: String,
    reconnect: Duration,
    mut rx: mpsc::Receiver<RelayMessage>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    loop {
        state.send_replace(ConnectionState::Connecting);
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => session(ws, &mut rx, &state, &cancel).await,
            Err(e) => debug!("Relay connect to {url} failed: {e}"),
        }
        if state.send_replace(ConnectionState::Disconnected) == ConnectionState::Connected {
            info!("Relay disconnected, retrying every {}s", reconnect.as_secs());
        }
        // Stale cues are worse than none
        while rx.try_recv().is_ok() {}

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(reconnect) => {}
        }
    }
}

async fn session(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    rx: &mut mpsc::Receiver<RelayMessage>,
    state: &watch::Sender<ConnectionState>,
    cancel: &CancellationToken,
) {
    let (mut write, mut read) = ws.split();

    loop {
        let connected = *state.borrow() == ConnectionState::Connected;
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.close().await;
                return;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<RelayMessage>(text.as_str()) {
                        Ok(RelayMessage::Connected { message }) => {
                            info!("Relay connected: {message}");
                            state.send_replace(ConnectionState::Connected);
                        }
                        Ok(other) => debug!("Relay says: {other:?}"),
                        Err(e) => debug!("Unparsed relay frame: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Relay connection error: {e}");
                    return;
                }
            },
            Some(msg) = rx.recv(), if connected => {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode relay message: {e}");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json.into())).await {
                    warn!("Relay send failed: {e}");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::relay::tests::Recorder;
    use crate::avatar::relay::{router, Bridge};
    use crate::config::RelayConfig;
    use crate::emotion::EmotionLabel;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::time::timeout;

    #[tokio::test]
    async fn connects_after_handshake_and_forwards() {
        let rec = Recorder::default();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(64);
        let bridge = Bridge::new(rec.clone(), &RelayConfig::default(), StdRng::seed_from_u64(1));
        tokio::spawn(bridge.run(rx, false, cancel.clone()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(tx)).await.unwrap() });

        let client = RelayClient::spawn(
            &AvatarConfig {
                enabled: true,
                relay_url: format!("ws://{addr}"),
                reconnect_secs: 1,
            },
            cancel.clone(),
        );
        let mut state = client.subscribe_state();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        client.set_emotion(EmotionTag {
            label: EmotionLabel::Joy,
            intensity: 0.6,
        });
        timeout(Duration::from_secs(5), async {
            while !rec.addresses().iter().any(|a| a == "/VMC/Ext/Blend/Apply") {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
    }

    #[tokio::test]
    async fn unreachable_relay_drops_cues() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let client = RelayClient::spawn(
            &AvatarConfig {
                enabled: true,
                relay_url: format!("ws://{addr}"),
                reconnect_secs: 1,
            },
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_ne!(client.state(), ConnectionState::Connected);

        for _ in 0..(QUEUE_DEPTH * 2) {
            client.set_mouth(0.5);
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn disabled_avatar_starts_no_client() {
        let cancel = CancellationToken::new();
        assert!(RelayClient::start(&AvatarConfig::default(), cancel.clone()).is_none());

        let enabled = AvatarConfig {
            enabled: true,
            ..Default::default()
        };
        let client = RelayClient::start(&enabled, cancel.clone()).unwrap();
        assert_ne!(client.state(), ConnectionState::Connected);
        cancel.cancel();
    }
}
