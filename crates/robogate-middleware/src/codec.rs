//! Wire codec for the [`Message`] envelope.
//!
//! Two encodings share one envelope shape:
//!
//! | [`WireFormat`] | Frame | Encoding |
//! |---|---|---|
//! | [`WireFormat::Json`] | WebSocket text | `serde_json` |
//! | [`WireFormat::MsgPack`] | WebSocket binary | MessagePack maps (`rmp-serde`) |
//!
//! MessagePack is written with field names (`to_vec_named`), so the payload
//! stays an open map and new keys never need a schema change.  Decoding never
//! panics; malformed input is reported as [`GateError::Codec`].

use std::fmt;
use std::str::FromStr;

use robogate_types::{GateError, Message};

/// Encoding of an outbound or inbound frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WireFormat {
    #[default]
    Json,
    MsgPack,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::MsgPack => "msgpack",
        }
    }

    /// Pick the outbound format from an upgrade URL query string such as
    /// `format=msgpack&foo=bar`.  Anything unrecognised selects JSON.
    pub fn from_query(query: Option<&str>) -> Self {
        query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "format")
            .and_then(|(_, value)| value.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireFormat {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "msgpack" | "messagepack" => Ok(WireFormat::MsgPack),
            other => Err(GateError::Codec(format!("unknown wire format: {other}"))),
        }
    }
}

/// Encode `msg` as a MessagePack map.
pub fn encode(msg: &Message) -> Result<Vec<u8>, GateError> {
    rmp_serde::to_vec_named(msg).map_err(|e| GateError::Codec(e.to_string()))
}

/// Decode a MessagePack frame.
pub fn decode(bytes: &[u8]) -> Result<Message, GateError> {
    rmp_serde::from_slice(bytes).map_err(|e| GateError::Codec(e.to_string()))
}

pub fn encode_json(msg: &Message) -> Result<String, GateError> {
    serde_json::to_string(msg).map_err(|e| GateError::Codec(e.to_string()))
}

pub fn decode_json(text: &str) -> Result<Message, GateError> {
    serde_json::from_str(text).map_err(|e| GateError::Codec(e.to_string()))
}

/// Encode `msg` in `format`.  JSON output is UTF-8.
pub fn encode_as(msg: &Message, format: WireFormat) -> Result<Vec<u8>, GateError> {
    match format {
        WireFormat::Json => encode_json(msg).map(String::into_bytes),
        WireFormat::MsgPack => encode(msg),
    }
}
