//! Voice-input control driven by mouse side buttons.
//!
//! IDLE → LISTENING → IDLE
//!
//! Press toggles the page's voice input on, release toggles it off and, with
//! auto-send, submits the message after a short delay. Commands go to every
//! connected page over a broadcast channel.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hotkey::HotkeyEvent;
use crate::settings::Settings;
use crate::timer::deadline;

/// Control action for the page link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageCommand {
    ToggleVoiceInput,
    SendMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    Listening,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Listening => write!(f, "LISTENING"),
        }
    }
}

pub struct VoiceInputController {
    settings: watch::Receiver<Settings>,
    commands: broadcast::Sender<PageCommand>,
    send_delay: Duration,
    state: ControlState,
    send_at: Option<Instant>,
}

impl VoiceInputController {
    pub fn new(
        settings: watch::Receiver<Settings>,
        commands: broadcast::Sender<PageCommand>,
        send_delay: Duration,
    ) -> Self {
        Self {
            settings,
            commands,
            send_delay,
            state: ControlState::Idle,
            send_at: None,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<HotkeyEvent>, cancel: CancellationToken) {
        info!("Voice input control ready");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => {
                        warn!("Hotkey channel closed");
                        return;
                    }
                },
                _ = deadline(self.send_at) => {
                    self.send_at = None;
                    info!("Auto-send");
                    self.emit(PageCommand::SendMessage);
                }
            }
        }
    }

    fn on_event(&mut self, event: HotkeyEvent) {
        let (enabled, target) = {
            let settings = self.settings.borrow();
            (settings.hotkey_enabled, settings.mouse_button)
        };
        if !enabled || !target.matches(event.button()) {
            debug!("Ignoring {event:?}");
            return;
        }

        match event {
            HotkeyEvent::Pressed(_) => self.on_press(),
            HotkeyEvent::Released(_) => self.on_release(),
        }
    }

    fn on_press(&mut self) {
        if self.state != ControlState::Idle {
            return;
        }
        // A new dictation supersedes a send still waiting from the last one
        self.send_at = None;
        self.state = ControlState::Listening;
        info!("State: IDLE → LISTENING");
        self.emit(PageCommand::ToggleVoiceInput);
    }

    fn on_release(&mut self) {
        if self.state != ControlState::Listening {
            return;
        }
        self.state = ControlState::Idle;
        info!("State: LISTENING → IDLE");
        self.emit(PageCommand::ToggleVoiceInput);

        if self.settings.borrow().auto_send {
            self.send_at = Some(Instant::now() + self.send_delay);
        }
    }

    fn emit(&self, command: PageCommand) {
        if self.commands.send(command).is_err() {
            debug!("No page connected, {command:?} dropped");
        }
    }
}
