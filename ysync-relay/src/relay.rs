//! Per-frame sync relay.
//!
//! One call to [`SyncRelay::handle`] takes one inbound frame from one
//! connection and turns it into storage mutations and outbound frames:
//!
//! ```text
//! syncStep1 (state vector) ──► diff against stored doc ──► reply syncStep2 to sender
//! syncStep2 / update       ──► trial apply ──► store_update ──► broadcast original frame to peers
//! awareness                ──► apply to invocation-local state, then dropped
//! queryAwareness           ──► nothing
//! ```
//!
//! Only a [`ProtocolError`] fails an invocation. Storage, registry and
//! delivery failures are logged and the invocation still succeeds.

use std::sync::Arc;

use crate::awareness::AwarenessState;
use crate::broadcast::Broadcaster;
use crate::crdt;
use crate::persistence::DocumentPersistence;
use crate::protocol::{Frame, ProtocolError};
use crate::registry::ConnectionRegistry;

/// One inbound frame and where it came from.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub document_id: String,
    pub sender_connection_id: String,
    pub frame: Vec<u8>,
}

/// Result reported to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    pub status_code: u16,
    pub body: String,
}

impl RelayResponse {
    pub fn success() -> Self {
        Self {
            status_code: 200,
            body: "success".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct SyncRelay {
    persistence: DocumentPersistence,
    registry: Arc<dyn ConnectionRegistry>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl SyncRelay {
    pub fn new(
        persistence: DocumentPersistence,
        registry: Arc<dyn ConnectionRegistry>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            persistence,
            registry,
            broadcaster,
        }
    }

    pub fn persistence(&self) -> &DocumentPersistence {
        &self.persistence
    }

    pub async fn handle(&self, request: &RelayRequest) -> Result<RelayResponse, ProtocolError> {
        let frame = Frame::decode(&request.frame)?;
        log::debug!(
            "Frame {:?} from {} on '{}'",
            frame.message_kind(),
            request.sender_connection_id,
            request.document_id
        );

        match frame {
            Frame::SyncStep1(peer_vector) => self.answer_step1(request, &peer_vector).await?,
            Frame::SyncStep2(update) | Frame::Update(update) => self.relay_update(request, update).await?,
            Frame::Awareness(payload) => {
                let mut state = AwarenessState::new();
                state.apply_update(&payload)?;
            }
            Frame::QueryAwareness => {}
        }
        Ok(RelayResponse::success())
    }

    async fn answer_step1(&self, request: &RelayRequest, peer_vector: &[u8]) -> Result<(), ProtocolError> {
        let diff = match self.persistence.get_diff(&request.document_id, peer_vector).await {
            Some(diff) => diff,
            None => {
                // Load failed: answer as if the document were empty.
                let empty = crdt::merge_updates(std::iter::empty())
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                crdt::diff(&empty.update, peer_vector).map_err(|e| ProtocolError::Malformed(e.to_string()))?
            }
        };

        let reply = Frame::SyncStep2(diff).encode();
        if let Err(e) = self.broadcaster.reply(&request.sender_connection_id, &reply).await {
            log::warn!("Reply to {} failed: {e}", request.sender_connection_id);
        }
        Ok(())
    }

    async fn relay_update(&self, request: &RelayRequest, update: Vec<u8>) -> Result<(), ProtocolError> {
        let doc = &request.document_id;
        // Only updates that integrate on their own reach the log.
        crdt::validate_update(&update).map_err(|e| ProtocolError::InvalidUpdate(e.to_string()))?;

        if self.persistence.store_update(doc, update).await.is_none() {
            log::warn!("Update from {} on '{doc}' was not persisted", request.sender_connection_id);
        }

        let peers = match self.registry.query(doc).await {
            Ok(peers) => peers,
            Err(e) => {
                log::warn!("Connection lookup for '{doc}' failed: {e}");
                Vec::new()
            }
        };

        let report = self
            .broadcaster
            .broadcast(&request.frame, &request.sender_connection_id, &peers)
            .await;
        log::debug!(
            "Broadcast on '{doc}': {} delivered, {} failed",
            report.delivered.len(),
            report.failed.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ConnectionHub;
    use crate::persistence::PersistenceConfig;
    use crate::registry::TableConnectionRegistry;
    use crate::storage::{MemoryTable, UpdateLogStore};

    fn relay() -> (SyncRelay, ConnectionHub) {
        let store = UpdateLogStore::new(Arc::new(MemoryTable::new()));
        let persistence = DocumentPersistence::new(store, PersistenceConfig::default());
        let registry = Arc::new(TableConnectionRegistry::new(Arc::new(MemoryTable::new())));
        let hub = ConnectionHub::new();
        (SyncRelay::new(persistence, registry, Arc::new(hub.clone())), hub)
    }

    fn request(frame: Vec<u8>) -> RelayRequest {
        RelayRequest {
            document_id: "doc".into(),
            sender_connection_id: "a".into(),
            frame,
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_invocation() {
        let (relay, _hub) = relay();
        assert!(matches!(
            relay.handle(&request(vec![7])).await,
            Err(ProtocolError::UnknownMessageKind(7))
        ));
        assert!(matches!(
            relay.handle(&request(vec![0, 5, 0])).await,
            Err(ProtocolError::UnknownSyncKind(5))
        ));
    }

    #[tokio::test]
    async fn test_query_awareness_is_noop() {
        let (relay, hub) = relay();
        let mut a = hub.register("a").await;
        let response = relay.handle(&request(Frame::QueryAwareness.encode())).await.unwrap();
        assert_eq!(response, RelayResponse::success());
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_awareness_not_persisted() {
        let (relay, _hub) = relay();
        let payload = crate::awareness::encode_update(&[crate::awareness::AwarenessEntry {
            client_id: 1,
            clock: 0,
            state: "{}".into(),
        }]);
        relay.handle(&request(Frame::Awareness(payload).encode())).await.unwrap();
        assert!(relay.persistence().store().get_updates("doc").await.unwrap().is_empty());

        assert!(matches!(
            relay.handle(&request(Frame::Awareness(vec![3]).encode())).await,
            Err(ProtocolError::InvalidAwareness(_))
        ));
    }

    fn text_update(client_id: u64, content: &str) -> Vec<u8> {
        use yrs::{Doc, ReadTxn, StateVector, Text, Transact, WriteTxn};

        let doc = Doc::with_client_id(client_id);
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, content);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    #[tokio::test]
    async fn test_corrupt_update_rejected_before_storage() {
        let (relay, hub) = relay();
        let registry = TableConnectionRegistry::new(Arc::new(MemoryTable::new()));
        registry.put("doc", "a").await.unwrap();
        registry.put("doc", "b").await.unwrap();
        let relay = SyncRelay::new(relay.persistence().clone(), Arc::new(registry), Arc::new(hub.clone()));
        let mut b = hub.register("b").await;

        for frame in [
            Frame::Update(crdt::CORRUPT_UPDATE.to_vec()),
            Frame::SyncStep2(crdt::CORRUPT_UPDATE.to_vec()),
        ] {
            assert!(matches!(
                relay.handle(&request(frame.encode())).await,
                Err(ProtocolError::InvalidUpdate(_))
            ));
        }
        assert!(relay.persistence().store().get_updates("doc").await.unwrap().is_empty());
        assert!(b.try_recv().is_err());

        // Document stays loadable and later updates still flow.
        let good = Frame::Update(text_update(1, "ok")).encode();
        relay.handle(&request(good.clone())).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), good);
        assert!(relay.persistence().get_document("doc").await.is_some());
    }

    #[tokio::test]
    async fn test_step1_on_empty_document() {
        let (relay, hub) = relay();
        let mut a = hub.register("a").await;
        relay.handle(&request(Frame::SyncStep1(Vec::new()).encode())).await.unwrap();

        let reply = Frame::decode(&a.recv().await.unwrap()).unwrap();
        assert!(matches!(reply, Frame::SyncStep2(_)));
    }
}
