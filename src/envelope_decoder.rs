/// Envelope Decoder
///
/// Turns raw broker payload bytes into an `AdminEventEnvelope`. A failure
/// here is never fatal to the consumer loop: the caller logs it and drops
/// the message.
use thiserror::Error;

use crate::types::{AdminEventEnvelope, ResourceType};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Empty payload")]
    Empty,

    #[error("Malformed envelope JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Envelope field {0} is empty")]
    MissingField(&'static str),
}

/// Decode one administrative event envelope.
pub fn decode(bytes: &[u8]) -> Result<AdminEventEnvelope, DecodeError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }

    let envelope: AdminEventEnvelope = serde_json::from_slice(bytes)?;

    if matches!(&envelope.resource_type, ResourceType::Other(raw) if raw.trim().is_empty()) {
        return Err(DecodeError::MissingField("resourceType"));
    }
    if envelope.operation_type.as_str().trim().is_empty() {
        return Err(DecodeError::MissingField("operationType"));
    }

    Ok(envelope)
}
