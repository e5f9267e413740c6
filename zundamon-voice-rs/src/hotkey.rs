//! Mouse side-button detection using evdev.
//!
//! Monitors every pointer device that has side buttons and reports press
//! and release of buttons 3 (back, `BTN_SIDE`) and 4 (forward, `BTN_EXTRA`)
//! through a tokio channel.

use evdev::{Device, EventType, InputEventKind, Key};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Side-button numbers as the browser reports them.
pub const BUTTON_BACK: u8 = 3;
pub const BUTTON_FORWARD: u8 = 4;

/// Events sent from the button monitor to the voice-input controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyEvent {
    Pressed(u8),
    Released(u8),
}

impl HotkeyEvent {
    pub fn button(self) -> u8 {
        match self {
            Self::Pressed(b) | Self::Released(b) => b,
        }
    }
}

fn button_number(key: Key) -> Option<u8> {
    match key {
        Key::BTN_SIDE => Some(BUTTON_BACK),
        Key::BTN_EXTRA => Some(BUTTON_FORWARD),
        _ => None,
    }
}

/// Map a raw key event to a button event. Repeats (value 2) and other
/// keys are ignored.
pub fn translate(key: Key, value: i32) -> Option<HotkeyEvent> {
    let button = button_number(key)?;
    match value {
        1 => Some(HotkeyEvent::Pressed(button)),
        0 => Some(HotkeyEvent::Released(button)),
        _ => None,
    }
}

pub struct HotkeyMonitor {
    tx: mpsc::Sender<HotkeyEvent>,
}

impl HotkeyMonitor {
    pub fn new(tx: mpsc::Sender<HotkeyEvent>) -> Self {
        Self { tx }
    }

    /// Find all pointer devices with at least one side button.
    pub fn find_mice() -> Vec<Device> {
        evdev::enumerate()
            .filter_map(|(_path, device)| {
                let keys = device.supported_keys()?;
                let is_mouse = keys.contains(Key::BTN_LEFT)
                    && (keys.contains(Key::BTN_SIDE) || keys.contains(Key::BTN_EXTRA));
                if !is_mouse {
                    return None;
                }
                info!(
                    "Found mouse: {} at {:?}",
                    device.name().unwrap_or("unknown"),
                    device.physical_path()
                );
                Some(device)
            })
            .collect()
    }

    /// Monitor a single device for side-button events.
    async fn monitor_device(device: Device, tx: mpsc::Sender<HotkeyEvent>) {
        let name = device.name().unwrap_or("unknown").to_string();
        debug!("Monitoring {name}");

        let mut events = match device.into_event_stream() {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot create event stream for {name}: {e}");
                return;
            }
        };

        loop {
            match events.next_event().await {
                Ok(event) => {
                    if event.event_type() != EventType::KEY {
                        continue;
                    }
                    let InputEventKind::Key(key) = event.kind() else {
                        continue;
                    };
                    if let Some(hotkey) = translate(key, event.value()) {
                        debug!("{name}: {hotkey:?}");
                        let _ = tx.try_send(hotkey);
                    }
                }
                Err(e) => {
                    warn!("Device {name} disconnected: {e}");
                    break;
                }
            }
        }
    }

    /// Start monitoring all mice. Runs until every device disconnects.
    pub async fn run(self) -> Result<()> {
        let mice = Self::find_mice();
        if mice.is_empty() {
            return Err(Error::Config(
                "no mouse with side buttons found; make sure you're in the 'input' group: \
                 sudo usermod -aG input $USER"
                    .into(),
            ));
        }

        info!("Monitoring {} mouse device(s)", mice.len());

        let handles: Vec<_> = mice
            .into_iter()
            .map(|device| tokio::spawn(Self::monitor_device(device, self.tx.clone())))
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}
