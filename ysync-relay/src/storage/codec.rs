//! Value encodings for the documents table.
//!
//! - Update blobs: LZ4 block compression with the original size prepended.
//!   CRDT updates carry long runs of small varints and repeated client ids,
//!   which LZ4 squeezes cheaply.
//! - State vector record: bincode of [`StateVectorRecord`].
//! - Meta values: bincode of [`MetaValue`]; the enum's variant index is the
//!   wire tag, so the variant order below is part of the storage format.

use serde::{Deserialize, Serialize};

use super::backend::StoreError;
use crate::Clock;

/// Compress an update blob for storage.
pub fn encode_update(update: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(update)
}

/// Decompress a stored update blob.
pub fn decode_update(stored: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(stored).map_err(|e| StoreError::Compression(e.to_string()))
}

/// Cached state vector paired with the clock it was computed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVectorRecord {
    /// Highest clock merged into `vector`
    pub watermark: Clock,
    /// Encoded (v1) state vector
    pub vector: Vec<u8>,
}

impl StateVectorRecord {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// Opaque value stored under a document meta key.
///
/// Exactly these four variants are supported. Integers are carried as
/// `Number`, matching the JSON-ish number model of the clients writing them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Binary(Vec<u8>),
}

impl MetaValue {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(value)
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::String(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::String(s)
    }
}

impl From<f64> for MetaValue {
    fn from(n: f64) -> Self {
        MetaValue::Number(n)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Boolean(b)
    }
}

impl From<Vec<u8>> for MetaValue {
    fn from(bytes: Vec<u8>) -> Self {
        MetaValue::Binary(bytes)
    }
}
