//! Static expression and gesture tables for the VRM avatar.
//!
//! Blend-shape weights are per-emotion multipliers of the intensity.
//! Gestures are bone rotations given as Euler degrees, where each axis may
//! scale with intensity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::emotion::EmotionLabel;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Quat = Quat { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    /// Rotation from Euler angles in degrees.
    pub fn from_euler_deg(x: f32, y: f32, z: f32) -> Self {
        let (sx, cx) = (x.to_radians() / 2.0).sin_cos();
        let (sy, cy) = (y.to_radians() / 2.0).sin_cos();
        let (sz, cz) = (z.to_radians() / 2.0).sin_cos();
        Self {
            x: sx * cy * cz - cx * sy * sz,
            y: cx * sy * cz + sx * cy * sz,
            z: cx * cy * sz - sx * sy * cz,
            w: cx * cy * cz + sx * sy * sz,
        }
    }
}

/// One bone target sent as `/VMC/Ext/Bone/Pos`.
#[derive(Debug, Clone, PartialEq)]
pub struct BonePose {
    pub bone: &'static str,
    pub position: Vec3,
    pub rotation: Quat,
}

pub const EXPRESSION_SHAPES: [&str; 5] = ["Joy", "Sorrow", "Angry", "Surprised", "Fun"];

const BLEND_TABLE: &[(EmotionLabel, &[(&str, f32)])] = &[
    (EmotionLabel::Joy, &[("Joy", 1.5), ("Fun", 1.3)]),
    (EmotionLabel::Sad, &[("Sorrow", 2.2), ("Joy", 0.0)]),
    (EmotionLabel::Surprised, &[("Surprised", 1.5), ("Joy", 0.8)]),
    (EmotionLabel::Angry, &[("Angry", 2.0)]),
    (EmotionLabel::Confused, &[("Surprised", 0.9), ("Sorrow", 1.0)]),
    (EmotionLabel::Worried, &[("Sorrow", 1.4), ("Surprised", 0.7)]),
    (EmotionLabel::Excited, &[("Joy", 1.5), ("Fun", 1.5), ("Surprised", 0.8)]),
    (EmotionLabel::Apologetic, &[("Sorrow", 1.5)]),
    (EmotionLabel::Grateful, &[("Joy", 1.4), ("Fun", 1.0)]),
    (EmotionLabel::Encouraging, &[("Joy", 1.2), ("Fun", 1.1)]),
    (EmotionLabel::Explaining, &[("Joy", 0.7)]),
    (EmotionLabel::Questioning, &[("Surprised", 0.9), ("Joy", 0.7)]),
    (EmotionLabel::Celebrating, &[("Joy", 1.5), ("Fun", 1.5), ("Surprised", 1.0)]),
    (EmotionLabel::Disappointed, &[("Sorrow", 1.8)]),
    (EmotionLabel::Impressed, &[("Surprised", 1.1), ("Joy", 1.2)]),
    (EmotionLabel::Playful, &[("Fun", 1.5), ("Joy", 1.3)]),
    (EmotionLabel::Serious, &[("Joy", 0.0), ("Sorrow", 0.7)]),
];

/// Blend-shape weights for an emotion. Labels without an entry get the
/// neutral set (every expression shape at zero).
pub fn emotion_shapes(label: EmotionLabel, intensity: f32) -> BTreeMap<String, f32> {
    match BLEND_TABLE.iter().find(|(l, _)| *l == label) {
        Some((_, weights)) => weights
            .iter()
            .map(|(shape, k)| (shape.to_string(), intensity * k))
            .collect(),
        None => neutral_shapes(),
    }
}

pub fn neutral_shapes() -> BTreeMap<String, f32> {
    EXPRESSION_SHAPES.iter().map(|s| (s.to_string(), 0.0)).collect()
}

/// Angle in degrees: `fixed + per_intensity * intensity`.
#[derive(Clone, Copy)]
struct Angle {
    fixed: f32,
    per_intensity: f32,
}

const fn deg(fixed: f32) -> Angle {
    Angle { fixed, per_intensity: 0.0 }
}

const fn scaled(per_intensity: f32) -> Angle {
    Angle { fixed: 0.0, per_intensity }
}

struct BoneSpec {
    bone: &'static str,
    position: Vec3,
    euler: [Angle; 3],
}

const fn bone(bone: &'static str, euler: [Angle; 3]) -> BoneSpec {
    BoneSpec { bone, position: Vec3::ZERO, euler }
}

const fn bone_at(bone: &'static str, position: Vec3, euler: [Angle; 3]) -> BoneSpec {
    BoneSpec { bone, position, euler }
}

const LUA: &str = "LeftUpperArm";
const RUA: &str = "RightUpperArm";
const LLA: &str = "LeftLowerArm";
const RLA: &str = "RightLowerArm";
const LH: &str = "LeftHand";
const RH: &str = "RightHand";

const Z0: Angle = deg(0.0);
// Arm tipped forward 45°, the resting hand for one-arm gestures
const FORWARD: [Angle; 3] = [deg(45.0), Z0, Z0];

const FISTS_UP: &[BoneSpec] = &[
    bone(LUA, [Z0, Z0, deg(70.0)]),
    bone(RUA, [Z0, Z0, deg(-70.0)]),
    bone(LLA, [Z0, deg(90.0), deg(70.0)]),
    bone(RLA, [Z0, deg(-90.0), deg(-70.0)]),
    bone(LH, [Z0, deg(90.0), deg(-70.0)]),
    bone(RH, [Z0, deg(-90.0), deg(70.0)]),
];

const NEUTRAL_GESTURE: &[BoneSpec] = &[
    bone(LUA, [Z0, Z0, deg(75.0)]),
    bone(RUA, [Z0, Z0, deg(-75.0)]),
];

const JOY_STRONG: &[BoneSpec] = &[
    bone(LUA, [Z0, Z0, deg(-60.0)]),
    bone(RUA, [Z0, Z0, deg(60.0)]),
    bone(LH, [Z0, deg(-45.0), Z0]),
    bone(RH, [Z0, deg(45.0), Z0]),
];

const JOY_STRONG_THRESHOLD: f32 = 0.8;

const GESTURE_TABLE: &[(EmotionLabel, &[BoneSpec])] = &[
    (
        EmotionLabel::Joy,
        &[bone(LUA, [Z0, Z0, scaled(-45.0)]), bone(RUA, [Z0, Z0, scaled(45.0)])],
    ),
    (
        EmotionLabel::Sad,
        &[
            bone_at(LUA, Vec3 { x: 0.0, y: 0.0, z: 90.0 }, [Z0, Z0, deg(75.0)]),
            bone(RUA, [Z0, Z0, deg(-75.0)]),
        ],
    ),
    (
        EmotionLabel::Surprised,
        &[bone(LUA, [Z0, deg(-45.0), deg(-70.0)]), bone(RUA, [Z0, deg(45.0), deg(70.0)])],
    ),
    (EmotionLabel::Angry, FISTS_UP),
    (EmotionLabel::Confused, FISTS_UP),
    (
        EmotionLabel::Worried,
        &[bone(LUA, [scaled(40.0), Z0, deg(20.0)]), bone(RUA, [scaled(40.0), Z0, deg(-20.0)])],
    ),
    (
        EmotionLabel::Excited,
        &[bone(LUA, [Z0, deg(-45.0), deg(-60.0)]), bone(RUA, [Z0, deg(45.0), deg(60.0)])],
    ),
    (
        EmotionLabel::Apologetic,
        &[bone(LUA, [Z0, deg(45.0), deg(60.0)]), bone(RUA, [Z0, deg(-45.0), deg(-60.0)])],
    ),
    (
        EmotionLabel::Grateful,
        &[bone(LUA, [scaled(-30.0), Z0, deg(-40.0)]), bone(RUA, FORWARD)],
    ),
    (
        EmotionLabel::Encouraging,
        &[
            bone_at(RUA, Vec3 { x: 0.0, y: 0.0, z: 90.0 }, [scaled(-15.0), deg(-90.0), deg(30.0)]),
            bone_at(LUA, Vec3 { x: 0.0, y: -90.0, z: 0.0 }, FORWARD),
        ],
    ),
    (
        EmotionLabel::Explaining,
        &[bone(LUA, [scaled(35.0), Z0, deg(-15.0)]), bone(RUA, FORWARD)],
    ),
    (
        EmotionLabel::Questioning,
        &[bone(RUA, [scaled(-25.0), Z0, deg(25.0)]), bone(LUA, FORWARD)],
    ),
    (
        EmotionLabel::Celebrating,
        &[bone(LUA, [Z0, deg(45.0), deg(-60.0)]), bone(RUA, [Z0, deg(-45.0), deg(60.0)])],
    ),
    (
        EmotionLabel::Disappointed,
        &[bone(LUA, [scaled(-80.0), Z0, Z0]), bone(RUA, [scaled(-80.0), Z0, Z0])],
    ),
    (
        EmotionLabel::Impressed,
        &[bone(LUA, [scaled(50.0), Z0, deg(25.0)]), bone(RUA, [scaled(50.0), Z0, deg(-25.0)])],
    ),
    (
        EmotionLabel::Playful,
        &[bone(LUA, [scaled(-20.0), Z0, deg(-35.0)]), bone(RUA, FORWARD)],
    ),
    (EmotionLabel::Serious, &[bone(LUA, FORWARD), bone(RUA, FORWARD)]),
    (EmotionLabel::Neutral, NEUTRAL_GESTURE),
    (
        EmotionLabel::Exasperated,
        &[bone(LUA, [Z0, Z0, deg(-30.0)]), bone(RUA, [Z0, Z0, deg(30.0)])],
    ),
];

fn resolve(specs: &[BoneSpec], intensity: f32) -> Vec<BonePose> {
    specs
        .iter()
        .map(|spec| {
            let [x, y, z] = spec
                .euler
                .map(|a| a.fixed + a.per_intensity * intensity);
            BonePose {
                bone: spec.bone,
                position: spec.position,
                rotation: Quat::from_euler_deg(x, y, z),
            }
        })
        .collect()
}

/// Bone targets for an emotion's gesture. Labels without an entry use the
/// neutral arms-down pose.
pub fn gesture(label: EmotionLabel, intensity: f32) -> Vec<BonePose> {
    if label == EmotionLabel::Joy && intensity >= JOY_STRONG_THRESHOLD {
        return resolve(JOY_STRONG, intensity);
    }
    let specs = GESTURE_TABLE
        .iter()
        .find(|(l, _)| *l == label)
        .map(|(_, specs)| *specs)
        .unwrap_or(NEUTRAL_GESTURE);
    resolve(specs, intensity)
}

/// Pose restored when a gesture decays: arms fully down, elbows and
/// wrists straight.
pub fn gesture_reset() -> Vec<BonePose> {
    const RESET: &[BoneSpec] = &[
        bone(LUA, [Z0, Z0, deg(75.0)]),
        bone(RUA, [Z0, Z0, deg(-75.0)]),
        bone(LLA, [Z0, Z0, Z0]),
        bone(RLA, [Z0, Z0, Z0]),
        bone(LH, [Z0, Z0, Z0]),
        bone(RH, [Z0, Z0, Z0]),
    ];
    resolve(RESET, 0.0)
}

/// Speaking pose: both upper arms lowered 70°.
pub fn arm_pose() -> Vec<BonePose> {
    const LOWERED: &[BoneSpec] = &[
        bone(LUA, [Z0, Z0, deg(70.0)]),
        bone(RUA, [Z0, Z0, deg(-70.0)]),
    ];
    resolve(LOWERED, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn euler_conversion() {
        let q = Quat::from_euler_deg(0.0, 0.0, 0.0);
        assert_eq!(q, Quat::IDENTITY);

        // 45° about X is the tipped-forward arm
        let q = Quat::from_euler_deg(45.0, 0.0, 0.0);
        assert!(close(q.x, 0.383) && close(q.w, 0.924));

        let q = Quat::from_euler_deg(0.0, 0.0, 90.0);
        assert!(close(q.z, std::f32::consts::FRAC_1_SQRT_2));
        assert!(close(q.w, std::f32::consts::FRAC_1_SQRT_2));
    }

    #[test]
    fn blend_shapes_scale_with_intensity() {
        let shapes = emotion_shapes(EmotionLabel::Joy, 0.5);
        assert_eq!(shapes["Joy"], 0.75);
        assert_eq!(shapes["Fun"], 0.65);

        let sad = emotion_shapes(EmotionLabel::Sad, 1.0);
        assert_eq!(sad["Joy"], 0.0);
        assert!(close(sad["Sorrow"], 2.2));
    }

    #[test]
    fn unmapped_emotions_are_neutral() {
        for label in [EmotionLabel::Scared, EmotionLabel::Relieved, EmotionLabel::Neutral] {
            let shapes = emotion_shapes(label, 0.9);
            assert_eq!(shapes.len(), EXPRESSION_SHAPES.len());
            assert!(shapes.values().all(|v| *v == 0.0));
        }
        assert_eq!(gesture(EmotionLabel::Scared, 0.9), gesture(EmotionLabel::Neutral, 0.0));
    }

    #[test]
    fn joy_has_strong_variant() {
        let mild = gesture(EmotionLabel::Joy, 0.5);
        let strong = gesture(EmotionLabel::Joy, 0.8);
        assert_eq!(mild.len(), 2);
        assert_eq!(strong.len(), 4);
        assert!(strong.iter().any(|b| b.bone == "LeftHand"));
    }

    #[test]
    fn every_label_has_a_gesture() {
        for label in EmotionLabel::ALL {
            assert!(!gesture(label, 0.5).is_empty(), "{label}");
        }
    }

    #[test]
    fn reset_straightens_everything() {
        let reset = gesture_reset();
        assert_eq!(reset.len(), 6);
        assert!(reset[2..].iter().all(|b| b.rotation == Quat::IDENTITY));
        let arms = arm_pose();
        assert!(arms[0].rotation.z > 0.0 && arms[1].rotation.z < 0.0);
    }
}
