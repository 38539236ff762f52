use std::collections::HashMap;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use permission_kernel_core::Node;
use serde::{Deserialize, Serialize};

/// The persisted (enduring) part of a holder.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredHolder {
    pub id: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// Persistence collaborator. The kernel only calls it from explicit load and
/// save operations; in-memory writes are never persisted implicitly.
pub trait HolderStorage: Send + Sync {
    /// # Errors
    /// Returns an error when the backing store cannot be read or decoded.
    fn load(&self, id: &str) -> Result<Option<StoredHolder>>;

    /// # Errors
    /// Returns an error when the holder cannot be encoded or written.
    fn save(&self, holder: &StoredHolder) -> Result<()>;

    /// # Errors
    /// Returns an error when the backing store cannot be listed.
    fn ids(&self) -> Result<Vec<String>>;
}

/// Process-local storage keeping each holder as a JSON document.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    documents: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw JSON document stored for `id`.
    #[must_use]
    pub fn document(&self, id: &str) -> Option<String> {
        self.documents.read().get(id).cloned()
    }

    /// Seeds a raw document, bypassing encoding.
    pub fn insert_document(&self, id: &str, document: String) {
        self.documents.write().insert(id.to_string(), document);
    }
}

impl HolderStorage for MemoryStorage {
    fn load(&self, id: &str) -> Result<Option<StoredHolder>> {
        let Some(document) = self.document(id) else {
            return Ok(None);
        };
        let holder = serde_json::from_str(&document)
            .with_context(|| format!("failed to decode stored holder `{id}`"))?;
        Ok(Some(holder))
    }

    fn save(&self, holder: &StoredHolder) -> Result<()> {
        let document = serde_json::to_string(holder)
            .with_context(|| format!("failed to encode holder `{}`", holder.id))?;
        self.documents.write().insert(holder.id.clone(), document);
        Ok(())
    }

    fn ids(&self) -> Result<Vec<String>> {
        let mut ids = self.documents.read().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use permission_kernel_core::ContextSet;

    use super::*;

    #[test]
    fn save_then_load_round_trips_nodes() -> Result<()> {
        let storage = MemoryStorage::new();
        let holder = StoredHolder {
            id: "steve".to_string(),
            nodes: vec![
                Node::permission("perm.fly").context(ContextSet::of("world", "nether")).build()?,
                Node::inheritance("vip").build()?,
            ],
        };
        storage.save(&holder)?;

        assert_eq!(storage.load("steve")?, Some(holder));
        assert_eq!(storage.load("alex")?, None);
        assert_eq!(storage.ids()?, vec!["steve".to_string()]);
        Ok(())
    }

    #[test]
    fn corrupt_document_is_reported_with_holder_id() {
        let storage = MemoryStorage::new();
        storage.insert_document("steve", r#"{"id":"steve","nodes":[{"type":"permission","permission":" "}]}"#.to_string());

        let err = match storage.load("steve") {
            Ok(loaded) => panic!("expected decode failure, got {loaded:?}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("stored holder `steve`"), "got: {err}");
    }
}
