//! Payload serialization.

use serde::Serialize;

use crate::error::SerializationError;

/// Turns a payload into a request body.
///
/// Must be deterministic: a payload that fails once fails every time, which
/// is why the dispatcher never retries a serialization failure.
pub trait PayloadSerializer<P>: Send + Sync {
    fn serialize(&self, payload: &P) -> Result<Vec<u8>, SerializationError>;
}

/// Serializes any `serde::Serialize` payload as compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl<P: Serialize> PayloadSerializer<P> for JsonSerializer {
    fn serialize(&self, payload: &P) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(payload)?)
    }
}

/// Sends payloads that are already encoded, byte for byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSerializer;

impl<P: AsRef<[u8]>> PayloadSerializer<P> for RawSerializer {
    fn serialize(&self, payload: &P) -> Result<Vec<u8>, SerializationError> {
        Ok(payload.as_ref().to_vec())
    }
}
