//! Wire message envelopes.
//!
//! Every message is a JSON array whose first element is a one-character
//! discriminator, e.g. `["d", [...patches], 1500]`. The reliable and
//! unreliable channel legs both carry this envelope.

use serde_json::{json, Value};
use thiserror::Error;

use crate::patch::PatchOp;

pub const JOIN_TAG: &str = "j";
pub const ACKNOWLEDGE_TAG: &str = "a";
pub const COMMAND_TAG: &str = "c";
pub const FULL_STATE_TAG: &str = "s";
pub const DELTA_STATE_TAG: &str = "d";
pub const DISCONNECT_TAG: &str = "e";
pub const CONTROL_TAG: &str = "x";

/// Control operation instructing the client to establish its unreliable
/// channel and switch to streaming state updates.
pub const CONTROL_SIMULATE: &str = "simulate";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message envelope must be an array starting with a tag")]
    NotAnEnvelope,
    #[error("unknown message tag `{0}`")]
    UnknownTag(String),
    #[error("malformed `{tag}` payload")]
    MalformedPayload { tag: &'static str },
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// `["s", state, tick]`: complete snapshot of the client's projection.
    FullState { state: Value, tick: u64 },
    /// `["d", patches, tick]`: cumulative patch list since the last ack.
    DeltaState { patches: Vec<PatchOp>, tick: u64 },
    /// `["c", payload]`: application event.
    Event { payload: Value },
    /// `["e", reason]`: fatal; the client must disconnect.
    Disconnect { reason: String },
    /// `["x", operation]`: e.g. `"simulate"`.
    Control { operation: String },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let envelope = match self {
            ServerMessage::FullState { state, tick } => json!([FULL_STATE_TAG, state, tick]),
            ServerMessage::DeltaState { patches, tick } => json!([DELTA_STATE_TAG, patches, tick]),
            ServerMessage::Event { payload } => json!([COMMAND_TAG, payload]),
            ServerMessage::Disconnect { reason } => json!([DISCONNECT_TAG, reason]),
            ServerMessage::Control { operation } => json!([CONTROL_TAG, operation]),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (tag, items) = split_envelope(bytes)?;
        match tag.as_str() {
            FULL_STATE_TAG => {
                let state = items
                    .get(1)
                    .cloned()
                    .ok_or(ProtocolError::MalformedPayload { tag: "s" })?;
                let tick = decode_tick(&items, "s")?;
                Ok(ServerMessage::FullState { state, tick })
            }
            DELTA_STATE_TAG => {
                let patches = items
                    .get(1)
                    .cloned()
                    .and_then(|raw| serde_json::from_value::<Vec<PatchOp>>(raw).ok())
                    .ok_or(ProtocolError::MalformedPayload { tag: "d" })?;
                let tick = decode_tick(&items, "d")?;
                Ok(ServerMessage::DeltaState { patches, tick })
            }
            COMMAND_TAG => {
                let payload = items
                    .get(1)
                    .cloned()
                    .ok_or(ProtocolError::MalformedPayload { tag: "c" })?;
                Ok(ServerMessage::Event { payload })
            }
            DISCONNECT_TAG => {
                let reason = decode_string(&items, "e")?;
                Ok(ServerMessage::Disconnect { reason })
            }
            CONTROL_TAG => {
                let operation = decode_string(&items, "x")?;
                Ok(ServerMessage::Control { operation })
            }
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["j", name]`: join handshake frame (also the UDP register datagram).
    Join { name: String },
    /// `["a", tick]`: state applied up to this tick.
    Acknowledge { tick: u64 },
    /// `["c", payload]`: application command.
    Command { payload: Value },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let envelope = match self {
            ClientMessage::Join { name } => json!([JOIN_TAG, name]),
            ClientMessage::Acknowledge { tick } => json!([ACKNOWLEDGE_TAG, tick]),
            ClientMessage::Command { payload } => json!([COMMAND_TAG, payload]),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (tag, items) = split_envelope(bytes)?;
        match tag.as_str() {
            JOIN_TAG => {
                let name = decode_string(&items, "j")?;
                Ok(ClientMessage::Join { name })
            }
            ACKNOWLEDGE_TAG => {
                let tick = items
                    .get(1)
                    .and_then(Value::as_u64)
                    .ok_or(ProtocolError::MalformedPayload { tag: "a" })?;
                Ok(ClientMessage::Acknowledge { tick })
            }
            COMMAND_TAG => {
                let payload = items
                    .get(1)
                    .cloned()
                    .ok_or(ProtocolError::MalformedPayload { tag: "c" })?;
                Ok(ClientMessage::Command { payload })
            }
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }
}

fn split_envelope(bytes: &[u8]) -> Result<(String, Vec<Value>), ProtocolError> {
    let envelope: Value = serde_json::from_slice(bytes)?;
    let Value::Array(items) = envelope else {
        return Err(ProtocolError::NotAnEnvelope);
    };
    let Some(Value::String(tag)) = items.first() else {
        return Err(ProtocolError::NotAnEnvelope);
    };
    Ok((tag.clone(), items))
}

fn decode_tick(items: &[Value], tag: &'static str) -> Result<u64, ProtocolError> {
    items
        .get(2)
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MalformedPayload { tag })
}

fn decode_string(items: &[Value], tag: &'static str) -> Result<String, ProtocolError> {
    match items.get(1) {
        Some(Value::String(text)) => Ok(text.clone()),
        _ => Err(ProtocolError::MalformedPayload { tag }),
    }
}
