//! Avatar integration: the relay link used by the speech pipeline and the
//! relay process that speaks VMC/OSC to the renderer.

pub mod client;
pub mod osc;
pub mod poses;
pub mod protocol;
pub mod relay;

pub use client::RelayClient;
pub use protocol::{AvatarLink, ConnectionState, RelayMessage};
