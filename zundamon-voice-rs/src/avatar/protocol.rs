//! Wire messages between the speech service and the avatar relay.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use super::poses::{Quat, Vec3};
use crate::emotion::{EmotionLabel, EmotionTag};

pub const VOWELS: [&str; 5] = ["A", "I", "U", "E", "O"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayMessage {
    /// Blend-shape weights, merged over the current expression
    Blend { shapes: BTreeMap<String, f32> },
    #[serde(rename_all = "camelCase")]
    Bone {
        bone_name: String,
        #[serde(default)]
        position: Vec3,
        #[serde(default)]
        rotation: Quat,
    },
    #[serde(rename_all = "camelCase")]
    SetArmPose { is_playing: bool },
    SetEmotion {
        #[serde(deserialize_with = "lenient_label")]
        emotion: EmotionLabel,
        intensity: f32,
    },
    SetGesture {
        #[serde(deserialize_with = "lenient_label")]
        emotion: EmotionLabel,
        intensity: f32,
    },
    /// Explicitly resume or stop idle expression cycling
    SetIdleCycling { active: bool },
    /// Relay handshake, sent once per accepted connection
    Connected {
        #[serde(default)]
        message: String,
    },
}

fn lenient_label<'de, D: Deserializer<'de>>(d: D) -> Result<EmotionLabel, D::Error> {
    let name = String::deserialize(d)?;
    Ok(EmotionLabel::from_name(&name))
}

impl RelayMessage {
    pub fn emotion(tag: EmotionTag) -> Self {
        Self::SetEmotion {
            emotion: tag.label,
            intensity: tag.intensity,
        }
    }

    pub fn gesture(tag: EmotionTag) -> Self {
        Self::SetGesture {
            emotion: tag.label,
            intensity: tag.intensity,
        }
    }

    pub fn mouth(openness: f32) -> Self {
        Self::Blend {
            shapes: mouth_shapes(openness),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Vowel weights for a mouth openness in 0..=1. Quiet input closes the
/// mouth; louder input opens I, then E, then A, with the other vowels at 0.
pub fn mouth_shapes(openness: f32) -> BTreeMap<String, f32> {
    let mut shapes: BTreeMap<String, f32> = VOWELS.iter().map(|v| (v.to_string(), 0.0)).collect();
    let v = openness.clamp(0.0, 1.0);
    if !(v >= 0.05) {
        return shapes;
    }

    let (vowel, weight) = if v < 0.3 {
        ("I", v * 2.0)
    } else if v < 0.6 {
        ("E", (v - 0.3) * 2.0 + 0.3)
    } else {
        ("A", (v - 0.6) * 2.0 + 0.5)
    };
    shapes.insert(vowel.to_string(), weight);
    shapes
}

/// The four avatar cues the speech pipeline emits. Implementations must
/// never block; delivery failures are dropped.
pub trait AvatarLink: Send + Sync {
    fn state(&self) -> ConnectionState;
    fn set_mouth(&self, openness: f32);
    fn set_arm_pose(&self, playing: bool);
    fn set_emotion(&self, tag: EmotionTag);
    fn set_gesture(&self, tag: EmotionTag);
}
