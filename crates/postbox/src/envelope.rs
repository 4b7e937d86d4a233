//! Command envelopes and the built-in Ack command.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{IpcError, MessageId, codec};

/// Reserved command name of the built-in acknowledgement.
pub const ACK_COMMAND: &str = "Ack";

/// A serialized command: its name plus command-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub command_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    /// Build an envelope from any serializable payload.
    pub fn new<P: Serialize>(
        command_name: impl Into<String>,
        payload: &P,
    ) -> Result<Self, IpcError> {
        let command_name = command_name.into();
        if command_name.trim().is_empty() {
            return Err(IpcError::InvalidArgument("command name is empty".into()));
        }
        let payload = serde_json::to_value(payload)
            .map_err(|e| IpcError::serialization("command payload", e))?;
        Ok(Self {
            command_name,
            payload,
        })
    }

    pub fn is_ack(&self) -> bool {
        self.command_name == ACK_COMMAND
    }

    /// Reconstruct the payload as `P`.
    pub fn decode_payload<P: DeserializeOwned>(&self) -> Result<P, IpcError> {
        P::deserialize(&self.payload).map_err(|e| IpcError::serialization("command payload", e))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IpcError> {
        codec::encode("command envelope", self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IpcError> {
        codec::decode("command envelope", bytes)
    }
}

/// Payload of the built-in acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub acknowledged_message_id: MessageId,
}

impl Ack {
    pub(crate) fn envelope(
        acknowledged_message_id: MessageId,
    ) -> Result<CommandEnvelope, IpcError> {
        CommandEnvelope::new(
            ACK_COMMAND,
            &Ack {
                acknowledged_message_id,
            },
        )
    }
}
