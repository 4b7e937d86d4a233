//! Serialization of envelopes and mailbox state.

use serde::{Serialize, de::DeserializeOwned};

use crate::IpcError;

/// Codec trait for wire serialization.
///
/// Everything written into shared memory (envelopes, mailbox state) goes
/// through one codec so both ends agree on the format.
pub trait Codec {
    /// Short format name used in diagnostics.
    const NAME: &'static str;

    /// Error type returned by encode operations.
    type EncodeError: std::error::Error;

    /// Error type returned by decode operations.
    type DecodeError: std::error::Error;

    /// Encode a value into bytes.
    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError>;

    /// Decode bytes into a value.
    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;
}

/// JSON codec: self-describing UTF-8 text using serde_json.
///
/// The wire format of the mailbox protocol. Mailbox contents can be inspected
/// as text, and peers written in other languages can parse them.
pub struct JsonCodec;

impl Codec for JsonCodec {
    const NAME: &'static str = "json";
    type EncodeError = serde_json::Error;
    type DecodeError = serde_json::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        serde_json::to_vec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        serde_json::from_slice(buf)
    }
}

/// The codec used on the wire.
pub type WireCodec = JsonCodec;

pub(crate) fn encode<T: Serialize>(context: &'static str, val: &T) -> Result<Vec<u8>, IpcError> {
    WireCodec::encode(val).map_err(|e| IpcError::serialization(context, e))
}

pub(crate) fn decode<T: DeserializeOwned>(
    context: &'static str,
    buf: &[u8],
) -> Result<T, IpcError> {
    WireCodec::decode(buf).map_err(|e| IpcError::serialization(context, e))
}
