//! Persistent `LocalFlowchartId ↔ FlowchartKey` mapping
//!
//! Two redb tables per storage namespace:
//!
//! ```text
//! flowchart_keys:<ns>       local id  -> 32 key bytes
//! flowchart_key_index:<ns>  key (hex) -> local id
//! ```
//!
//! An in-memory mirror serves lookups; every mutation is written through to
//! redb before it becomes visible. If the database cannot be opened or read the
//! store degrades to an empty in-memory one: the workspace simply appears to
//! have no shared flowcharts yet.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info, warn};

use crate::error::{CollabError, CollabResult};
use crate::storage::Storage;
use crate::types::{FlowchartKey, LocalFlowchartId};

#[derive(Debug, Default)]
struct KeyMirror {
    by_id: HashMap<LocalFlowchartId, FlowchartKey>,
    by_key: HashMap<FlowchartKey, LocalFlowchartId>,
}

impl KeyMirror {
    fn insert(&mut self, id: LocalFlowchartId, key: FlowchartKey) {
        self.by_key.insert(key, id.clone());
        self.by_id.insert(id, key);
    }
}

/// Namespaced, durable key store
pub struct KeyStore {
    db: Arc<RwLock<Database>>,
    namespace: String,
    keys_table: String,
    index_table: String,
    mirror: RwLock<KeyMirror>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("namespace", &self.namespace)
            .field("entries", &self.mirror.read().by_id.len())
            .finish()
    }
}

impl KeyStore {
    /// Open (or create) the key store at `path`.
    ///
    /// Any failure to open or read the file is logged and the store falls back
    /// to an empty in-memory database.
    pub fn open(path: impl AsRef<Path>, namespace: &str) -> CollabResult<Self> {
        Self::with_storage(&Storage::open_or_in_memory(path)?, namespace)
    }

    /// Key store backed by an in-memory database
    pub fn in_memory(namespace: &str) -> CollabResult<Self> {
        Self::with_storage(&Storage::in_memory()?, namespace)
    }

    /// Keep the key tables in an existing storage file
    pub fn with_storage(storage: &Storage, namespace: &str) -> CollabResult<Self> {
        let store = Self {
            db: storage.db_handle(),
            namespace: namespace.to_string(),
            keys_table: format!("flowchart_keys:{}", namespace),
            index_table: format!("flowchart_key_index:{}", namespace),
            mirror: RwLock::new(KeyMirror::default()),
        };
        store.create_tables()?;
        let count = store.load();
        info!(namespace, count, "Key store opened");
        Ok(store)
    }

    fn keys_def(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.keys_table)
    }

    fn index_def(&self) -> TableDefinition<'_, &'static str, &'static str> {
        TableDefinition::new(&self.index_table)
    }

    fn create_tables(&self) -> CollabResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(self.keys_def())?;
            let _ = write_txn.open_table(self.index_def())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Storage namespace of this store
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lookups
    // ═══════════════════════════════════════════════════════════════════════

    /// Return the key for `id`, generating and persisting one if absent.
    ///
    /// Calling this twice for the same id always yields the same key.
    pub fn get_or_create_key(&self, id: &LocalFlowchartId) -> CollabResult<FlowchartKey> {
        let mut mirror = self.mirror.write();
        if let Some(key) = mirror.by_id.get(id) {
            return Ok(*key);
        }

        let key = FlowchartKey::generate();
        self.write_entry(id, &key, None)?;
        mirror.insert(id.clone(), key);
        info!(flowchart = %id, key = %key.short(), "Created flowchart key");
        Ok(key)
    }

    /// Local id for a key, synthesizing `shared-xxxxxxxx` when unknown.
    ///
    /// A synthesized id is persisted so later joins of the same key agree.
    pub fn resolve_local_id(&self, key: &FlowchartKey) -> CollabResult<LocalFlowchartId> {
        let mut mirror = self.mirror.write();
        if let Some(id) = mirror.by_key.get(key) {
            return Ok(id.clone());
        }

        let id = key.synthesized_local_id();
        let displaced = mirror.by_id.get(&id).copied();
        self.write_entry(&id, key, displaced.as_ref())?;
        if let Some(old) = displaced {
            mirror.by_key.remove(&old);
        }
        mirror.insert(id.clone(), *key);
        debug!(flowchart = %id, key = %key.short(), "Synthesized local id for joined key");
        Ok(id)
    }

    /// Key stored for `id`, if any
    pub fn lookup_key(&self, id: &LocalFlowchartId) -> Option<FlowchartKey> {
        self.mirror.read().by_id.get(id).copied()
    }

    /// Local id stored for `key`, if any
    pub fn lookup_local_id(&self, key: &FlowchartKey) -> Option<LocalFlowchartId> {
        self.mirror.read().by_key.get(key).cloned()
    }

    /// All associations, sorted by local id
    pub fn list(&self) -> Vec<(LocalFlowchartId, FlowchartKey)> {
        let mirror = self.mirror.read();
        let mut entries: Vec<_> = mirror.by_id.iter().map(|(id, key)| (id.clone(), *key)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.mirror.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mutations
    // ═══════════════════════════════════════════════════════════════════════

    /// Forget the key for `id`
    pub fn remove(&self, id: &LocalFlowchartId) -> CollabResult<Option<FlowchartKey>> {
        let mut mirror = self.mirror.write();
        let Some(key) = mirror.by_id.get(id).copied() else {
            return Ok(None);
        };

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut keys = write_txn.open_table(self.keys_def())?;
            keys.remove(id.as_str())?;
            let mut index = write_txn.open_table(self.index_def())?;
            index.remove(key.to_hex().as_str())?;
        }
        write_txn.commit()?;

        mirror.by_id.remove(id);
        mirror.by_key.remove(&key);
        info!(flowchart = %id, "Removed flowchart key");
        Ok(Some(key))
    }

    /// Replace the key for `id` with a fresh one.
    ///
    /// Holders of the old key can no longer find or join this flowchart.
    pub fn rotate_key(&self, id: &LocalFlowchartId) -> CollabResult<FlowchartKey> {
        let mut mirror = self.mirror.write();
        let old = mirror.by_id.get(id).copied();

        let key = FlowchartKey::generate();
        self.write_entry(id, &key, old.as_ref())?;
        if let Some(old) = old {
            mirror.by_key.remove(&old);
        }
        mirror.insert(id.clone(), key);
        info!(flowchart = %id, key = %key.short(), "Rotated flowchart key");
        Ok(key)
    }

    /// Write one association (and drop the displaced reverse entry) in a single transaction
    fn write_entry(
        &self,
        id: &LocalFlowchartId,
        key: &FlowchartKey,
        displaced: Option<&FlowchartKey>,
    ) -> CollabResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut keys = write_txn.open_table(self.keys_def())?;
            keys.insert(id.as_str(), key.as_bytes().as_slice())?;
            let mut index = write_txn.open_table(self.index_def())?;
            if let Some(old) = displaced {
                index.remove(old.to_hex().as_str())?;
            }
            index.insert(key.to_hex().as_str(), id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Process boundaries
    // ═══════════════════════════════════════════════════════════════════════

    /// Refresh the in-memory mirror from disk.
    ///
    /// A read failure leaves an empty mirror and is logged. Returns the number
    /// of associations loaded.
    pub fn load(&self) -> usize {
        let loaded = match self.read_all() {
            Ok(mirror) => mirror,
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "Failed to load flowchart keys, starting empty");
                KeyMirror::default()
            }
        };
        let count = loaded.by_id.len();
        *self.mirror.write() = loaded;
        count
    }

    fn read_all(&self) -> CollabResult<KeyMirror> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(self.keys_def())?;

        let mut mirror = KeyMirror::default();
        for entry in table.iter()? {
            let (id, bytes) = entry?;
            let bytes: [u8; 32] = bytes.value().try_into().map_err(|_| {
                CollabError::Storage(format!("stored key for {} is not 32 bytes", id.value()))
            })?;
            mirror.insert(LocalFlowchartId::new(id.value()), FlowchartKey::from_bytes(bytes));
        }
        Ok(mirror)
    }

    /// Write the whole mirror back to disk in one transaction
    pub fn persist(&self) -> CollabResult<()> {
        let mirror = self.mirror.read();
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut keys = write_txn.open_table(self.keys_def())?;
            let mut index = write_txn.open_table(self.index_def())?;
            for (id, key) in &mirror.by_id {
                keys.insert(id.as_str(), key.as_bytes().as_slice())?;
                index.insert(key.to_hex().as_str(), id.as_str())?;
            }
        }
        write_txn.commit()?;
        debug!(namespace = %self.namespace, count = mirror.by_id.len(), "Persisted flowchart keys");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let store = KeyStore::in_memory("test").unwrap();
        let id = LocalFlowchartId::new("fc1");

        let first = store.get_or_create_key(&id).unwrap();
        let second = store.get_or_create_key(&id).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup_local_id(&first), Some(id));
    }

    #[test]
    fn test_distinct_ids_get_distinct_keys() {
        let store = KeyStore::in_memory("test").unwrap();
        let a = store.get_or_create_key(&"a".into()).unwrap();
        let b = store.get_or_create_key(&"b".into()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_resolve_known_and_unknown_keys() {
        let store = KeyStore::in_memory("test").unwrap();
        let id = LocalFlowchartId::new("fc1");
        let key = store.get_or_create_key(&id).unwrap();
        assert_eq!(store.resolve_local_id(&key).unwrap(), id);

        let foreign = FlowchartKey::generate();
        let synthesized = store.resolve_local_id(&foreign).unwrap();
        assert_eq!(synthesized, foreign.synthesized_local_id());
        assert_eq!(store.resolve_local_id(&foreign).unwrap(), synthesized);
        assert_eq!(store.lookup_key(&synthesized), Some(foreign));
    }

    #[test]
    fn test_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("keys.redb");
        let id = LocalFlowchartId::new("fc1");

        let key = {
            let store = KeyStore::open(&path, "editor").unwrap();
            store.get_or_create_key(&id).unwrap()
        };

        let store = KeyStore::open(&path, "editor").unwrap();
        assert_eq!(store.lookup_key(&id), Some(key));
        assert_eq!(store.get_or_create_key(&id).unwrap(), key);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let storage = Storage::in_memory().unwrap();
        let a = KeyStore::with_storage(&storage, "app-a").unwrap();
        let b = KeyStore::with_storage(&storage, "app-b").unwrap();

        a.get_or_create_key(&"fc1".into()).unwrap();
        assert!(b.is_empty());
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_corrupt_file_degrades_to_empty_store() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("keys.redb");
        std::fs::write(&path, vec![0xAB; 8192]).unwrap();

        let store = KeyStore::open(&path, "editor").unwrap();
        assert!(store.is_empty());
        // still usable, just not durable
        let key = store.get_or_create_key(&"fc1".into()).unwrap();
        assert_eq!(store.lookup_key(&"fc1".into()), Some(key));
    }

    #[test]
    fn test_rotate_replaces_key_and_drops_old_index() {
        let store = KeyStore::in_memory("test").unwrap();
        let id = LocalFlowchartId::new("fc1");
        let old = store.get_or_create_key(&id).unwrap();

        let new = store.rotate_key(&id).unwrap();
        assert_ne!(old, new);
        assert_eq!(store.lookup_key(&id), Some(new));
        assert_eq!(store.lookup_local_id(&old), None);

        store.load();
        assert_eq!(store.lookup_key(&id), Some(new));
    }

    #[test]
    fn test_remove() {
        let store = KeyStore::in_memory("test").unwrap();
        let id = LocalFlowchartId::new("fc1");
        let key = store.get_or_create_key(&id).unwrap();

        assert_eq!(store.remove(&id).unwrap(), Some(key));
        assert_eq!(store.remove(&id).unwrap(), None);
        assert!(store.lookup_local_id(&key).is_none());
        assert_eq!(store.load(), 0);
    }

    #[test]
    fn test_persist_then_load_round_trip() {
        let store = KeyStore::in_memory("test").unwrap();
        store.get_or_create_key(&"a".into()).unwrap();
        store.get_or_create_key(&"b".into()).unwrap();
        store.persist().unwrap();

        assert_eq!(store.load(), 2);
        let ids: Vec<_> = store.list().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![LocalFlowchartId::new("a"), LocalFlowchartId::new("b")]);
    }
}
