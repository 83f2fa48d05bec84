//! Which connections are attached to which document.

use std::sync::Arc;

use async_trait::async_trait;

use crate::storage::keys::{document_range, namespace};
use crate::storage::{KvBackend, StoreError};

#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn put(&self, document_id: &str, connection_id: &str) -> Result<(), StoreError>;

    async fn delete(&self, document_id: &str, connection_id: &str) -> Result<(), StoreError>;

    /// Live connection ids for a document.
    async fn query(&self, document_id: &str) -> Result<Vec<String>, StoreError>;
}

/// Registry kept in its own backing table, one `[ns][connection id]` key per
/// attached connection.
#[derive(Clone)]
pub struct TableConnectionRegistry {
    table: Arc<dyn KvBackend>,
}

impl TableConnectionRegistry {
    pub fn new(table: Arc<dyn KvBackend>) -> Self {
        Self { table }
    }

    /// Drop every registration. Connections do not survive a restart, so a
    /// durable registry is cleared on startup.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let keys = self.table.scan_keys(&[], &[0xFF; 5]).await?;
        let total = keys.len();
        for chunk in keys.chunks(self.table.max_batch_size().max(1)) {
            self.table.batch_delete(chunk.to_vec()).await?;
        }
        Ok(total)
    }

    fn key(document_id: &str, connection_id: &str) -> Vec<u8> {
        let mut key = namespace(document_id);
        key.extend_from_slice(connection_id.as_bytes());
        key
    }
}

#[async_trait]
impl ConnectionRegistry for TableConnectionRegistry {
    async fn put(&self, document_id: &str, connection_id: &str) -> Result<(), StoreError> {
        self.table.put(&Self::key(document_id, connection_id), &[]).await
    }

    async fn delete(&self, document_id: &str, connection_id: &str) -> Result<(), StoreError> {
        self.table.delete(&Self::key(document_id, connection_id)).await
    }

    async fn query(&self, document_id: &str) -> Result<Vec<String>, StoreError> {
        let prefix = namespace(document_id);
        let (start, end) = document_range(document_id);
        let keys = self.table.scan_keys(&start, &end).await?;

        keys.into_iter()
            .map(|key| {
                let id = key.get(prefix.len()..).unwrap_or_default();
                String::from_utf8(id.to_vec())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))
            })
            .collect()
    }
}
