//! Binding to the `yrs` CRDT engine.
//!
//! The engine is used as a black box: updates go in, one merged update and
//! its state vector come out. All encodings are Yjs v1.
//!
//! `yrs` can panic on updates that decode but do not integrate. Every entry
//! point here runs the engine under [`std::panic::catch_unwind`] and reports
//! such a panic as [`CrdtError::Panicked`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// CRDT engine errors.
#[derive(Debug, thiserror::Error)]
pub enum CrdtError {
    #[error("invalid update encoding: {0}")]
    InvalidUpdate(String),
    #[error("invalid state vector encoding: {0}")]
    InvalidStateVector(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("crdt engine panicked: {0}")]
    Panicked(String),
}

/// Result of merging an update log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedDocument {
    /// Full document state as a single v1 update
    pub update: Vec<u8>,
    /// Encoded v1 state vector of `update`
    pub state_vector: Vec<u8>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run engine work, turning a panic into an error.
fn guarded<T>(work: impl FnOnce() -> Result<T, CrdtError>) -> Result<T, CrdtError> {
    panic::catch_unwind(AssertUnwindSafe(work))
        .unwrap_or_else(|payload| Err(CrdtError::Panicked(panic_message(payload))))
}

fn apply_all<'a>(doc: &Doc, updates: impl IntoIterator<Item = &'a [u8]>) -> Result<(), CrdtError> {
    let mut txn = doc.transact_mut();
    for bytes in updates {
        let update = Update::decode_v1(bytes).map_err(|e| CrdtError::InvalidUpdate(e.to_string()))?;
        txn.apply_update(update)
            .map_err(|e| CrdtError::Apply(e.to_string()))?;
    }
    Ok(())
}

/// Merge updates, in the given order, into one snapshot.
///
/// An empty input yields the empty document.
pub fn merge_updates<'a>(updates: impl IntoIterator<Item = &'a [u8]>) -> Result<MergedDocument, CrdtError> {
    guarded(|| {
        let doc = Doc::new();
        apply_all(&doc, updates)?;

        let txn = doc.transact();
        Ok(MergedDocument {
            update: txn.encode_state_as_update_v1(&StateVector::default()),
            state_vector: txn.state_vector().encode_v1(),
        })
    })
}

/// Check that an update integrates on its own.
///
/// Done on a throwaway document before the update reaches the log.
pub fn validate_update(update: &[u8]) -> Result<(), CrdtError> {
    merge_updates([update]).map(|_| ())
}

/// Encode what `snapshot` has that a peer at `peer_vector` lacks.
///
/// Empty `peer_vector` bytes mean the peer has nothing.
pub fn diff(snapshot: &[u8], peer_vector: &[u8]) -> Result<Vec<u8>, CrdtError> {
    let remote = if peer_vector.is_empty() {
        StateVector::default()
    } else {
        StateVector::decode_v1(peer_vector).map_err(|e| CrdtError::InvalidStateVector(e.to_string()))?
    };

    guarded(|| {
        let doc = Doc::new();
        apply_all(&doc, [snapshot])?;
        let txn = doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    })
}

/// Encoded state vector of a snapshot.
pub fn state_vector_of(snapshot: &[u8]) -> Result<Vec<u8>, CrdtError> {
    guarded(|| {
        let doc = Doc::new();
        apply_all(&doc, [snapshot])?;
        let txn = doc.transact();
        Ok(txn.state_vector().encode_v1())
    })
}

/// Decodes as a v1 update but breaks block integration inside `yrs`.
#[cfg(test)]
pub(crate) const CORRUPT_UPDATE: &[u8] = &[
    1, 4, 7, 0, 4, 1, 7, 99, 111, 110, 116, 101, 110, 116, 2, 104, 101, 129, 7, 1, 3, 132, 7, 121,
    6, 32, 119, 111, 114, 108, 100, 40, 1, 1, 109, 1, 107, 1, 125, 5, 1, 7, 1, 2, 3,
];

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    fn text_update(client_id: u64, content: &str) -> Vec<u8> {
        let doc = Doc::with_client_id(client_id);
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, content);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn read_text(update: &[u8]) -> String {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        apply_all(&doc, [update]).unwrap();
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[test]
    fn test_merge_empty_is_empty_document() {
        let merged = merge_updates(std::iter::empty()).unwrap();
        assert_eq!(read_text(&merged.update), "");
        assert_eq!(merged.state_vector, StateVector::default().encode_v1());
    }

    #[test]
    fn test_merge_combines_clients() {
        let a = text_update(1, "hello");
        let b = text_update(2, "world");
        let merged = merge_updates([a.as_slice(), b.as_slice()]).unwrap();

        let text = read_text(&merged.update);
        assert_eq!(text.len(), 10);
        assert!(text.contains("hello") && text.contains("world"));

        let sv = StateVector::decode_v1(&merged.state_vector).unwrap();
        assert_eq!(sv.get(&1), 5);
        assert_eq!(sv.get(&2), 5);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = text_update(1, "abc");
        let once = merge_updates([a.as_slice()]).unwrap();
        let twice = merge_updates([a.as_slice(), a.as_slice()]).unwrap();
        assert_eq!(read_text(&once.update), read_text(&twice.update));
        assert_eq!(once.state_vector, twice.state_vector);
    }

    #[test]
    fn test_diff_against_peer_vector() {
        let a = text_update(1, "abc");
        let b = text_update(2, "xyz");
        let merged = merge_updates([a.as_slice(), b.as_slice()]).unwrap();

        // Peer already has client 1's edits.
        let peer_sv = state_vector_of(&a).unwrap();
        let missing = diff(&merged.update, &peer_sv).unwrap();
        let rebuilt = merge_updates([a.as_slice(), missing.as_slice()]).unwrap();
        assert_eq!(rebuilt.state_vector, merged.state_vector);

        let everything = diff(&merged.update, &[]).unwrap();
        assert_eq!(read_text(&everything), read_text(&merged.update));
    }

    #[test]
    fn test_corrupt_update_is_an_error_not_a_panic() {
        assert!(merge_updates([CORRUPT_UPDATE]).is_err());
        assert!(validate_update(CORRUPT_UPDATE).is_err());
        assert!(state_vector_of(CORRUPT_UPDATE).is_err());

        // Engine is still usable afterwards.
        let ok = text_update(1, "fine");
        assert!(validate_update(&ok).is_ok());
        assert_eq!(read_text(&merge_updates([ok.as_slice()]).unwrap().update), "fine");
    }

    #[test]
    fn test_guarded_reports_panic_message() {
        let result: Result<(), CrdtError> = guarded(|| panic!("block index out of bounds"));
        assert!(matches!(result, Err(CrdtError::Panicked(msg)) if msg.contains("out of bounds")));
    }

    #[test]
    fn test_garbage_update_rejected() {
        assert!(merge_updates([[0xFFu8, 0xFF, 0xFF].as_slice()]).is_err());
        assert!(matches!(
            diff(&text_update(1, "a"), &[0xFF]),
            Err(CrdtError::InvalidStateVector(_))
        ));
    }
}
