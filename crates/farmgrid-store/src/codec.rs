//! File codecs, selected by file name suffix.

use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// A decoded file payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            Payload::Json(_) => None,
        }
    }
}

/// Converts between file bytes and payloads for files ending in `suffix`.
pub trait Codec: Send + Sync {
    /// Suffix (including the dot) of the files this codec handles.
    fn suffix(&self) -> &str;

    /// Decode file bytes. `None` means the file is corrupt; callers treat
    /// that the same as a missing file.
    fn decode(&self, bytes: &[u8]) -> Option<Payload>;

    fn encode(&self, payload: &Payload) -> StoreResult<Vec<u8>>;
}

/// `.json` files as `serde_json::Value`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn suffix(&self) -> &str {
        ".json"
    }

    fn decode(&self, bytes: &[u8]) -> Option<Payload> {
        match serde_json::from_slice(bytes) {
            Ok(value) => Some(Payload::Json(value)),
            Err(e) => {
                debug!(error = %e, "undecodable json file");
                None
            }
        }
    }

    fn encode(&self, payload: &Payload) -> StoreResult<Vec<u8>> {
        match payload {
            Payload::Json(value) => {
                serde_json::to_vec(value).map_err(|e| StoreError::Encode(e.to_string()))
            }
            Payload::Bytes(_) => Err(StoreError::Encode(
                "json codec cannot encode raw bytes".to_string(),
            )),
        }
    }
}

/// Opaque byte blobs for an arbitrary suffix.
#[derive(Debug, Clone)]
pub struct RawCodec {
    suffix: String,
}

impl RawCodec {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

impl Codec for RawCodec {
    fn suffix(&self) -> &str {
        &self.suffix
    }

    fn decode(&self, bytes: &[u8]) -> Option<Payload> {
        Some(Payload::Bytes(bytes.to_vec()))
    }

    fn encode(&self, payload: &Payload) -> StoreResult<Vec<u8>> {
        match payload {
            Payload::Bytes(bytes) => Ok(bytes.clone()),
            Payload::Json(value) => {
                serde_json::to_vec(value).map_err(|e| StoreError::Encode(e.to_string()))
            }
        }
    }
}
