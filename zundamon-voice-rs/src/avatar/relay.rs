//! Avatar relay: WebSocket in, VMC/OSC over UDP out.
//!
//! All relay state lives in one [`Bridge`] task. WebSocket connections only
//! parse frames and forward them over a channel, so expression timers and
//! idle cycling never race each other.

use std::collections::BTreeMap;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::osc::{self, OscMessage};
use super::poses::{self, BonePose};
use super::protocol::{RelayMessage, VOWELS};
use crate::config::RelayConfig;
use crate::emotion::EmotionLabel;
use crate::timer::deadline;
use crate::{Error, Result};

const IDLE_EMOTIONS: [EmotionLabel; 9] = [
    EmotionLabel::Joy,
    EmotionLabel::Sad,
    EmotionLabel::Surprised,
    EmotionLabel::Confused,
    EmotionLabel::Worried,
    EmotionLabel::Excited,
    EmotionLabel::Grateful,
    EmotionLabel::Playful,
    EmotionLabel::Questioning,
];

/// Where encoded OSC packets go.
pub trait PacketSink: Send {
    fn send(&mut self, packet: &[u8]);
}

pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpSink {
    pub fn bind(host: &str, port: u16) -> Result<Self> {
        let target = format!("{host}:{port}")
            .parse()
            .map_err(|e| Error::Relay(format!("invalid OSC target {host}:{port}: {e}")))?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        info!("OSC socket bound to {}, target {target}", socket.local_addr()?);
        Ok(Self { socket, target })
    }
}

impl PacketSink for UdpSink {
    fn send(&mut self, packet: &[u8]) {
        if let Err(e) = self.socket.send_to(packet, self.target) {
            warn!("OSC send failed: {e}");
        }
    }
}

struct Expression {
    label: EmotionLabel,
    shapes: BTreeMap<String, f32>,
}

impl Expression {
    fn neutral() -> Self {
        Self {
            label: EmotionLabel::Neutral,
            shapes: poses::neutral_shapes(),
        }
    }
}

/// Relay state machine. Owns the expression, the decay timers and idle
/// cycling.
pub struct Bridge<S> {
    sink: S,
    expression: Expression,
    decay: Duration,
    idle_interval: Duration,
    emotion_reset_at: Option<Instant>,
    gesture_reset_at: Option<Instant>,
    next_idle_at: Option<Instant>,
    rng: StdRng,
}

impl<S: PacketSink> Bridge<S> {
    pub fn new(sink: S, config: &RelayConfig, rng: StdRng) -> Self {
        Self {
            sink,
            expression: Expression::neutral(),
            decay: Duration::from_secs(config.decay_secs),
            idle_interval: Duration::from_secs(config.idle_interval_secs),
            emotion_reset_at: None,
            gesture_reset_at: None,
            next_idle_at: None,
            rng,
        }
    }

    pub fn idle_active(&self) -> bool {
        self.next_idle_at.is_some()
    }

    pub fn current_emotion(&self) -> EmotionLabel {
        self.expression.label
    }

    fn send(&mut self, msg: OscMessage) {
        self.sink.send(&msg.encode());
    }

    fn send_shapes(&mut self, shapes: &BTreeMap<String, f32>) {
        let mut merged = self.expression.shapes.clone();
        merged.extend(shapes.iter().map(|(k, v)| (k.clone(), *v)));
        for (name, value) in &merged {
            self.send(osc::blend_val(name, *value));
        }
        self.send(osc::blend_apply());
    }

    fn send_bones(&mut self, bones: &[BonePose]) {
        self.send(osc::root_pos());
        for pose in bones {
            self.send(osc::bone_pos(pose));
        }
    }

    fn apply_expression(&mut self, label: EmotionLabel, intensity: f32) {
        self.emotion_reset_at = None;
        self.expression = Expression {
            label,
            shapes: poses::emotion_shapes(label, intensity),
        };
        let shapes = self.expression.shapes.clone();
        self.send_shapes(&shapes);
    }

    pub fn handle(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::Blend { shapes } => self.send_shapes(&shapes),
            RelayMessage::Bone {
                bone_name,
                position,
                rotation,
            } => self.send(osc::bone(&bone_name, position, rotation)),
            RelayMessage::SetArmPose { is_playing } => {
                debug!("Arm pose (playing={is_playing})");
                self.send_bones(&poses::arm_pose());
            }
            RelayMessage::SetEmotion { emotion, intensity } => {
                info!("Emotion: {emotion} ({intensity:.2})");
                if emotion != EmotionLabel::Neutral && self.idle_active() {
                    info!("Idle cycling stopped by explicit emotion");
                    self.next_idle_at = None;
                }
                self.apply_expression(emotion, intensity);
                if emotion != EmotionLabel::Neutral {
                    self.emotion_reset_at = Some(Instant::now() + self.decay);
                }
            }
            RelayMessage::SetGesture { emotion, intensity } => {
                info!("Gesture: {emotion} ({intensity:.2})");
                self.send_bones(&poses::gesture(emotion, intensity));
                self.gesture_reset_at = Some(Instant::now() + self.decay);
            }
            RelayMessage::SetIdleCycling { active } => self.set_idle(active),
            RelayMessage::Connected { .. } => {}
        }
    }

    pub fn set_idle(&mut self, active: bool) {
        match (active, self.idle_active()) {
            (true, false) => {
                info!("Idle cycling started");
                self.next_idle_at = Some(Instant::now() + self.idle_interval);
            }
            (false, true) => {
                info!("Idle cycling stopped");
                self.next_idle_at = None;
            }
            _ => {}
        }
    }

    fn reset_emotion(&mut self) {
        debug!("Expression decayed to neutral");
        self.apply_expression(EmotionLabel::Neutral, 0.0);
    }

    fn reset_gesture(&mut self) {
        debug!("Gesture decayed");
        let bones = poses::gesture_reset();
        for pose in &bones {
            self.send(osc::bone_pos(pose));
        }
    }

    fn idle_tick(&mut self) {
        if self.rng.gen_bool(0.5) {
            self.apply_expression(EmotionLabel::Neutral, 0.0);
        } else {
            let label = IDLE_EMOTIONS[self.rng.gen_range(0..IDLE_EMOTIONS.len())];
            let intensity = 0.3 + self.rng.gen::<f32>() * 0.4;
            debug!("Idle expression: {label} ({intensity:.2})");
            self.apply_expression(label, intensity);
        }
        self.next_idle_at = Some(Instant::now() + self.idle_interval);
    }

    /// Initial pose, then the event loop until cancelled or every sender
    /// is gone.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<RelayMessage>,
        idle_on_start: bool,
        cancel: CancellationToken,
    ) {
        self.send_bones(&poses::arm_pose());
        self.set_idle(idle_on_start);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                _ = deadline(self.emotion_reset_at) => {
                    self.emotion_reset_at = None;
                    self.reset_emotion();
                }
                _ = deadline(self.gesture_reset_at) => {
                    self.gesture_reset_at = None;
                    self.reset_gesture();
                }
                _ = deadline(self.next_idle_at) => self.idle_tick(),
            }
        }
        info!("Relay bridge stopped");
    }
}

/// WebSocket endpoint; every accepted socket feeds the same bridge.
pub fn router(bridge: mpsc::Sender<RelayMessage>) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .with_state(bridge)
}

async fn ws_upgrade(
    State(bridge): State<mpsc::Sender<RelayMessage>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, bridge))
}

async fn handle_socket(socket: WebSocket, bridge: mpsc::Sender<RelayMessage>) {
    let (mut sender, mut receiver) = socket.split();

    let hello = RelayMessage::Connected {
        message: "VRM Bridge Server ready".into(),
    };
    if let Ok(text) = serde_json::to_string(&hello) {
        if sender.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
    info!("Relay client connected");

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<RelayMessage>(text.as_str()) {
                Ok(msg) => {
                    if is_loggable(&msg) {
                        debug!("Relay message: {msg:?}");
                    }
                    if bridge.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Bad relay message: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    info!("Relay client disconnected");
}

// Closed-mouth frames arrive at audio rate
fn is_loggable(msg: &RelayMessage) -> bool {
    match msg {
        RelayMessage::Blend { shapes } => VOWELS
            .iter()
            .any(|v| shapes.get(*v).is_some_and(|w| *w != 0.0)),
        _ => true,
    }
}

/// Run the relay until cancelled.
pub async fn serve(config: &RelayConfig, cancel: CancellationToken) -> Result<()> {
    let sink = UdpSink::bind(&config.osc_host, config.osc_port)?;
    let (tx, rx) = mpsc::channel(256);
    let bridge = Bridge::new(sink, config, StdRng::from_entropy());
    let bridge_task = tokio::spawn(bridge.run(rx, config.idle_on_start, cancel.clone()));

    let addr = SocketAddr::from(([127, 0, 0, 1], config.ws_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Relay listening on ws://{addr}, OSC → {}:{}", config.osc_host, config.osc_port);

    let shutdown = cancel.clone();
    axum::serve(listener, router(tx))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    cancel.cancel();
    let _ = bridge_task.await;
    Ok(())
}
