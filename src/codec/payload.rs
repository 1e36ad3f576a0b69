//! Gateway payload model
//!
//! Every frame on the wire is `{"op": u8, "d": any, "s": u64?, "t": string?}`.
//! Inbound frames are decoded into [`InboundPayload`]; outbound frames are
//! built from the typed structs below.

use super::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Gateway opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl Opcode {
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }
}

#[derive(Deserialize)]
struct RawPayload {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    /// Op 0: application event with its sequence number
    Dispatch {
        sequence: u64,
        event: String,
        data: Value,
    },
    /// Op 1: the gateway wants a heartbeat right now
    Heartbeat,
    /// Op 7
    Reconnect,
    /// Op 9
    InvalidSession { resumable: bool },
    /// Op 10: first frame of every connection
    Hello { heartbeat_interval: Duration },
    /// Op 11
    HeartbeatAck,
    /// Anything this client does not act on
    Unknown { op: u8 },
}

impl InboundPayload {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Dispatch { .. } => Opcode::Dispatch as u8,
            Self::Heartbeat => Opcode::Heartbeat as u8,
            Self::Reconnect => Opcode::Reconnect as u8,
            Self::InvalidSession { .. } => Opcode::InvalidSession as u8,
            Self::Hello { .. } => Opcode::Hello as u8,
            Self::HeartbeatAck => Opcode::HeartbeatAck as u8,
            Self::Unknown { op } => *op,
        }
    }
}

/// Decodes one complete JSON message.
pub fn decode_json(bytes: &[u8]) -> Result<InboundPayload, DecodeError> {
    let raw: RawPayload = serde_json::from_slice(bytes)?;

    let payload = match Opcode::from_u8(raw.op) {
        Some(Opcode::Dispatch) => InboundPayload::Dispatch {
            sequence: raw.s.ok_or(DecodeError::MissingField { op: raw.op, field: "s" })?,
            event: raw.t.ok_or(DecodeError::MissingField { op: raw.op, field: "t" })?,
            data: raw.d,
        },
        Some(Opcode::Heartbeat) => InboundPayload::Heartbeat,
        Some(Opcode::Reconnect) => InboundPayload::Reconnect,
        Some(Opcode::InvalidSession) => InboundPayload::InvalidSession {
            resumable: raw.d.as_bool().unwrap_or(false),
        },
        Some(Opcode::Hello) => {
            let millis = raw
                .d
                .get("heartbeat_interval")
                .and_then(Value::as_u64)
                .ok_or(DecodeError::MissingField { op: raw.op, field: "heartbeat_interval" })?;
            InboundPayload::Hello {
                heartbeat_interval: Duration::from_millis(millis),
            }
        }
        Some(Opcode::HeartbeatAck) => InboundPayload::HeartbeatAck,
        _ => InboundPayload::Unknown { op: raw.op },
    };

    Ok(payload)
}

#[derive(Serialize)]
struct Outbound<'a, T: Serialize> {
    op: u8,
    d: &'a T,
}

/// Client properties sent with IDENTIFY
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Op 2 body. Holds the token, so it deliberately has no `Debug`.
#[derive(Serialize)]
pub struct Identify<'a> {
    pub token: &'a str,
    pub intents: u64,
    pub properties: &'a IdentifyProperties,
    pub shard: [u32; 2],
    pub large_threshold: u32,
    pub compress: bool,
}

/// Op 6 body
#[derive(Serialize)]
pub struct Resume<'a> {
    pub token: &'a str,
    pub session_id: &'a str,
    pub seq: u64,
}

pub fn encode_identify(identify: &Identify<'_>) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Outbound { op: Opcode::Identify as u8, d: identify })
}

pub fn encode_resume(resume: &Resume<'_>) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Outbound { op: Opcode::Resume as u8, d: resume })
}

/// Heartbeat carries the last sequence seen, or null before the first dispatch.
pub fn encode_heartbeat(sequence: Option<u64>) -> String {
    json!({ "op": Opcode::Heartbeat as u8, "d": sequence }).to_string()
}
