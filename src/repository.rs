//! The `Repository` collaborator interface (§6): document-oriented
//! persistence the core consumes for replication snapshots and for
//! distributed-state entries marked persistent. A transient repository error
//! is treated by the health monitor as UNHEALTHY for the corresponding
//! check; persistence backends themselves (document store, kv cache) are
//! external collaborators, not owned here.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A persisted document, keyed by an opaque string id (`ha_state/<key>` or
/// `ha_snapshots/<data_type>/<origin_node_id>/<origin_counter>`, per §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub payload: Vec<u8>,
    /// blake3 checksum of `payload`, carried alongside for integrity
    /// verification on read.
    pub checksum: [u8; 32],
}

impl Document {
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
        let checksum = blake3::hash(&payload).into();
        Self {
            id: id.into(),
            payload,
            checksum,
        }
    }

    pub fn verify(&self) -> bool {
        blake3::hash(&self.payload) == blake3::Hash::from(self.checksum)
    }
}

/// A filter over document ids, used by `query`. Kept deliberately minimal —
/// the state manager is scoped to bot-relevant keys, not general querying.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub id_prefix: Option<String>,
}

#[async_trait]
pub trait Repository: Send + Sync + std::fmt::Debug {
    async fn get_by_id(&self, id: &str) -> Result<Option<Document>>;
    async fn upsert(&self, doc: Document) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn query(&self, filter: Filter) -> Result<Vec<Document>>;
    async fn bulk_upsert(&self, docs: Vec<Document>) -> Result<()>;
}

/// In-memory reference implementation, used by tests and as the backing
/// store for a degenerate single-node deployment.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    docs: Arc<RwLock<HashMap<String, Document>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_by_id(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.docs.read().await.get(id).cloned())
    }

    async fn upsert(&self, doc: Document) -> Result<()> {
        if !doc.verify() {
            return Err(Error::Repository(format!("checksum mismatch for {}", doc.id)));
        }
        self.docs.write().await.insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.docs.write().await.remove(id);
        Ok(())
    }

    async fn query(&self, filter: Filter) -> Result<Vec<Document>> {
        let docs = self.docs.read().await;
        Ok(docs
            .values()
            .filter(|d| match &filter.id_prefix {
                Some(prefix) => d.id.starts_with(prefix.as_str()),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn bulk_upsert(&self, docs: Vec<Document>) -> Result<()> {
        for doc in docs {
            self.upsert(doc).await?;
        }
        Ok(())
    }
}
