//! Gateway frame codec
//!
//! Turns raw transport frames into tagged [`InboundPayload`]s and encodes the
//! few payloads a shard sends. The `zlib-stream` inflation context is owned by
//! [`FrameDecoder`], one per connection, and must never be shared.

mod close_code;
mod inflate;
mod payload;

pub use close_code::{CloseCode, CloseDisposition};
pub use inflate::{Inflater, ZLIB_SUFFIX};
pub use payload::{
    decode_json, encode_heartbeat, encode_identify, encode_resume, Identify, IdentifyProperties,
    InboundPayload, Opcode, Resume,
};

use std::str::FromStr;
use thiserror::Error;

/// Frame decoding failures
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed JSON payload")]
    Json(#[from] serde_json::Error),

    #[error("corrupt zlib stream")]
    Inflate(#[from] flate2::DecompressError),

    #[error("payload for opcode {op} is missing field '{field}'")]
    MissingField { op: u8, field: &'static str },

    #[error("inflated message exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Transport compression negotiated in the connect URL
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    /// Plain JSON text frames
    #[default]
    None,
    /// One zlib context for the whole connection, messages end with `00 00 ff ff`
    ZlibStream,
}

impl Compression {
    /// Value for the `compress` query parameter, if any.
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::ZlibStream => Some("zlib-stream"),
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" | "false" => Ok(Self::None),
            "zlib-stream" | "zlib" | "on" | "true" => Ok(Self::ZlibStream),
            other => Err(format!("unknown compression '{other}'")),
        }
    }
}

/// Per-connection decoder
///
/// Text frames are always plain JSON. Binary frames are fed through the
/// connection's inflater when compression is on, and otherwise treated as
/// UTF-8 JSON bytes.
pub struct FrameDecoder {
    inflater: Option<Inflater>,
}

impl FrameDecoder {
    pub fn new(compression: Compression) -> Self {
        let inflater = match compression {
            Compression::None => None,
            Compression::ZlibStream => Some(Inflater::new()),
        };
        Self { inflater }
    }

    pub fn decode_text(&mut self, text: &str) -> Result<InboundPayload, DecodeError> {
        decode_json(text.as_bytes())
    }

    /// Returns `Ok(None)` while a compressed message is still incomplete.
    pub fn decode_binary(&mut self, bytes: &[u8]) -> Result<Option<InboundPayload>, DecodeError> {
        match &mut self.inflater {
            Some(inflater) => match inflater.push(bytes)? {
                Some(message) => decode_json(&message).map(Some),
                None => Ok(None),
            },
            None => decode_json(bytes).map(Some),
        }
    }

    /// Bytes of the current incomplete compressed message.
    pub fn buffered(&self) -> usize {
        self.inflater.as_ref().map_or(0, Inflater::buffered)
    }
}
