//! zundamon-voice: a local voice bridge for chat pages.
//!
//! Finalized assistant replies reported by the page link are cleaned,
//! chunked, tagged with an emotion, synthesized by VOICEVOX and played in
//! order with prefetch. Mouse side buttons drive the page's voice input,
//! and an optional relay moves a VRM avatar in step with the speech.

pub mod api;
pub mod avatar;
pub mod chunker;
pub mod config;
pub mod emotion;
pub mod error;
pub mod history;
pub mod hotkey;
pub mod normalizer;
pub mod observer;
pub mod pipeline;
pub mod playback;
pub mod service;
pub mod settings;
pub mod synthesis;
mod timer;

pub use error::{Error, Result};
