//! Real-time channel envelope.
//!
//! Every frame on the room channel is a JSON object `{type, payload}`.
//! Decoding is done in two steps (envelope first, then the payload for the
//! recognized `type`) so that an unknown type and a malformed payload are
//! reported as different errors, and the authority can answer each with a
//! precise `error` message.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::tempo::TempoState;

/// Tempo change requested by a client over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TempoProposal {
    /// Room the proposal targets.
    #[serde(rename = "roomId")]
    pub room_id: String,
    /// Proposed tempo.
    pub bpm: f64,
    /// Display name of the proposer.
    pub proposed_by: String,
    /// Client wall clock when the proposal was made (Unix ms).
    #[ts(type = "number")]
    pub client_ms: i64,
}

/// Clock sync request. `t0_client` is echoed back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TimeSyncPing {
    /// Client send time (Unix ms, client clock).
    #[ts(type = "number")]
    pub t0_client: i64,
}

/// Clock sync reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TimeSyncPong {
    /// Echo of the ping's `t0_client`.
    #[ts(type = "number")]
    pub t0_client: i64,
    /// Authority receive time.
    #[ts(type = "number")]
    pub t1_server: i64,
    /// Authority send time.
    #[ts(type = "number")]
    pub t2_server: i64,
}

/// Payload of an `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ErrorPayload {
    /// Human-readable description.
    pub message: String,
}

/// A decoded channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// Full room state (authority to client).
    TempoState(TempoState),
    /// Tempo change request (client to authority).
    TempoProposal(TempoProposal),
    /// Clock sync request (client to authority).
    TimeSyncPing(TimeSyncPing),
    /// Clock sync reply (authority to client).
    TimeSyncPong(TimeSyncPong),
    /// Subscription acknowledgement; carries nothing.
    Subscribe,
    /// Error report (authority to client).
    Error(ErrorPayload),
}

/// Errors produced while decoding a channel frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame is not a JSON `{type, payload}` object.
    #[error("invalid message format: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The `type` field names no known message.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The payload does not match the shape required by its `type`.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        /// The message type whose payload failed.
        kind: &'static str,
        /// The underlying parse error.
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct OutEnvelope<'a, P: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: P,
}

impl ChannelMessage {
    /// Wire name of this message's `type`.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TempoState(_) => "tempo_state",
            Self::TempoProposal(_) => "tempo_proposal",
            Self::TimeSyncPing(_) => "time_sync_ping",
            Self::TimeSyncPong(_) => "time_sync_pong",
            Self::Subscribe => "subscribe",
            Self::Error(_) => "error",
        }
    }

    /// Build an `error` message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    /// Serialize into a `{type, payload}` JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let kind = self.kind();
        match self {
            Self::TempoState(p) => serde_json::to_string(&OutEnvelope { kind, payload: p }),
            Self::TempoProposal(p) => serde_json::to_string(&OutEnvelope { kind, payload: p }),
            Self::TimeSyncPing(p) => serde_json::to_string(&OutEnvelope { kind, payload: p }),
            Self::TimeSyncPong(p) => serde_json::to_string(&OutEnvelope { kind, payload: p }),
            Self::Subscribe => serde_json::to_string(&OutEnvelope {
                kind,
                payload: serde_json::Value::Null,
            }),
            Self::Error(p) => serde_json::to_string(&OutEnvelope { kind, payload: p }),
        }
    }

    /// Decode a `{type, payload}` JSON frame.
    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        let raw: RawEnvelope = serde_json::from_str(text).map_err(DecodeError::Malformed)?;
        match raw.kind.as_str() {
            "tempo_state" => decode_payload("tempo_state", raw.payload).map(Self::TempoState),
            "tempo_proposal" => {
                decode_payload("tempo_proposal", raw.payload).map(Self::TempoProposal)
            }
            "time_sync_ping" => {
                decode_payload("time_sync_ping", raw.payload).map(Self::TimeSyncPing)
            }
            "time_sync_pong" => {
                decode_payload("time_sync_pong", raw.payload).map(Self::TimeSyncPong)
            }
            "subscribe" => Ok(Self::Subscribe),
            "error" => decode_payload("error", raw.payload).map(Self::Error),
            _ => Err(DecodeError::UnknownType(raw.kind)),
        }
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    payload: serde_json::Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(payload).map_err(|source| DecodeError::InvalidPayload { kind, source })
}
