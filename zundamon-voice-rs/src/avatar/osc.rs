//! Minimal OSC 1.0 message encoder for the VMC protocol.
//!
//! Only string and float32 arguments are needed. Strings are NUL-terminated
//! and padded to 4 bytes; floats are big-endian.

use super::poses::{BonePose, Quat, Vec3};

#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Str(String),
    Float(f32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            args: Vec::new(),
        }
    }

    pub fn string(mut self, s: &str) -> Self {
        self.args.push(OscArg::Str(s.to_string()));
        self
    }

    pub fn float(mut self, f: f32) -> Self {
        self.args.push(OscArg::Float(f));
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        push_padded(&mut buf, &self.address);

        let mut tags = String::with_capacity(self.args.len() + 1);
        tags.push(',');
        for arg in &self.args {
            tags.push(match arg {
                OscArg::Str(_) => 's',
                OscArg::Float(_) => 'f',
            });
        }
        push_padded(&mut buf, &tags);

        for arg in &self.args {
            match arg {
                OscArg::Str(s) => push_padded(&mut buf, s),
                OscArg::Float(f) => buf.extend_from_slice(&f.to_be_bytes()),
            }
        }
        buf
    }
}

fn push_padded(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

pub fn blend_val(name: &str, value: f32) -> OscMessage {
    OscMessage::new("/VMC/Ext/Blend/Val").string(name).float(value)
}

pub fn blend_apply() -> OscMessage {
    OscMessage::new("/VMC/Ext/Blend/Apply")
}

fn transform(address: &str, name: &str, position: Vec3, rotation: Quat) -> OscMessage {
    OscMessage::new(address)
        .string(name)
        .float(position.x)
        .float(position.y)
        .float(position.z)
        .float(rotation.x)
        .float(rotation.y)
        .float(rotation.z)
        .float(rotation.w)
}

pub fn bone(name: &str, position: Vec3, rotation: Quat) -> OscMessage {
    transform("/VMC/Ext/Bone/Pos", name, position, rotation)
}

pub fn bone_pos(pose: &BonePose) -> OscMessage {
    bone(pose.bone, pose.position, pose.rotation)
}

/// Root transform; receivers expect it ahead of any bone burst.
pub fn root_pos() -> OscMessage {
    transform("/VMC/Ext/Root/Pos", "root", Vec3::ZERO, Quat::IDENTITY)
}

/// Address of an encoded packet, for logging and tests.
pub fn packet_address(packet: &[u8]) -> Option<&str> {
    let end = packet.iter().position(|b| *b == 0)?;
    std::str::from_utf8(&packet[..end]).ok()
}
