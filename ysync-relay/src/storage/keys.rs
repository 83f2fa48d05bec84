//! Composite key layout for the documents table.
//!
//! ```text
//! ┌───────────────┬──────────────┬─────────────┬──────────────────────┐
//! │ doc id length │ doc id UTF-8 │ record type │ suffix               │
//! │ u32 BE        │ variable     │ 1 byte      │ depends on type      │
//! └───────────────┴──────────────┴─────────────┴──────────────────────┘
//!
//! 0x01 update       suffix = clock (u64 BE, so byte order == clock order)
//! 0x02 meta         suffix = meta key UTF-8
//! 0x03 state vector suffix = none (singleton)
//! 0x04 clock        suffix = none (atomic counter)
//! ```
//!
//! The length prefix keeps one document's namespace from being a prefix of
//! another's (`"doc"` vs `"doc2"`).

use crate::Clock;

/// Record type tag following the document namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Update = 0x01,
    Meta = 0x02,
    StateVector = 0x03,
    Clock = 0x04,
}

/// Upper bound sentinel for a whole-document scan.
const NAMESPACE_END: u8 = 0xFF;

/// `[len][doc]` prefix shared by every record of a document.
pub fn namespace(doc_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + doc_id.len() + 9);
    key.extend_from_slice(&(doc_id.len() as u32).to_be_bytes());
    key.extend_from_slice(doc_id.as_bytes());
    key
}

fn record_prefix(doc_id: &str, record: RecordType) -> Vec<u8> {
    let mut key = namespace(doc_id);
    key.push(record as u8);
    key
}

pub fn update_key(doc_id: &str, clock: Clock) -> Vec<u8> {
    let mut key = record_prefix(doc_id, RecordType::Update);
    key.extend_from_slice(&clock.to_be_bytes());
    key
}

/// Key range covering updates with `from <= clock < to`.
pub fn update_range(doc_id: &str, from: Clock, to: Clock) -> (Vec<u8>, Vec<u8>) {
    (update_key(doc_id, from), update_key(doc_id, to))
}

/// Key range covering every update of a document.
pub fn all_updates_range(doc_id: &str) -> (Vec<u8>, Vec<u8>) {
    (
        record_prefix(doc_id, RecordType::Update),
        record_prefix(doc_id, RecordType::Meta),
    )
}

/// Extract the clock from an update key.
pub fn decode_update_clock(key: &[u8]) -> Option<Clock> {
    if key.len() < 8 + 1 {
        return None;
    }
    let (head, suffix) = key.split_at(key.len() - 8);
    if head.last() != Some(&(RecordType::Update as u8)) {
        return None;
    }
    let buf: [u8; 8] = suffix.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}

pub fn meta_key(doc_id: &str, meta_key: &str) -> Vec<u8> {
    let mut key = record_prefix(doc_id, RecordType::Meta);
    key.extend_from_slice(meta_key.as_bytes());
    key
}

/// Range over the meta namespace: `[ns,0x02] .. [ns,0x03]`.
pub fn meta_range(doc_id: &str) -> (Vec<u8>, Vec<u8>) {
    (
        record_prefix(doc_id, RecordType::Meta),
        record_prefix(doc_id, RecordType::StateVector),
    )
}

/// Strip the meta prefix from a key, returning the meta key.
pub fn decode_meta_key(doc_id: &str, key: &[u8]) -> Option<String> {
    let prefix = record_prefix(doc_id, RecordType::Meta);
    let rest = key.strip_prefix(prefix.as_slice())?;
    String::from_utf8(rest.to_vec()).ok()
}

pub fn state_vector_key(doc_id: &str) -> Vec<u8> {
    record_prefix(doc_id, RecordType::StateVector)
}

pub fn clock_key(doc_id: &str) -> Vec<u8> {
    record_prefix(doc_id, RecordType::Clock)
}

/// Range over every record of a document.
pub fn document_range(doc_id: &str) -> (Vec<u8>, Vec<u8>) {
    let start = namespace(doc_id);
    let mut end = start.clone();
    end.push(NAMESPACE_END);
    (start, end)
}
