//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Flowchart snapshots (local persistence cache, written on every mutation)
//! - The shared database handle the [`KeyStore`](crate::keystore::KeyStore)
//!   keeps its namespaced key tables in

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::warn;

use crate::error::CollabError;
use crate::types::{FlowchartSnapshot, LocalFlowchartId};

const DOCUMENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

/// Read/write contract of the local document cache
///
/// The core reads an initial snapshot at startup and writes back after every
/// applied mutation.
pub trait SnapshotCache: Send + Sync + 'static {
    /// Load the cached snapshot for a flowchart, if any
    fn load(&self, id: &LocalFlowchartId) -> Result<Option<FlowchartSnapshot>, CollabError>;

    /// Replace the cached snapshot for a flowchart
    fn store(&self, id: &LocalFlowchartId, snapshot: &FlowchartSnapshot) -> Result<(), CollabError>;
}

/// Cache that remembers nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl SnapshotCache for NoCache {
    fn load(&self, _id: &LocalFlowchartId) -> Result<Option<FlowchartSnapshot>, CollabError> {
        Ok(None)
    }

    fn store(&self, _id: &LocalFlowchartId, _snapshot: &FlowchartSnapshot) -> Result<(), CollabError> {
        Ok(())
    }
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("db", &"<redb::Database>").finish()
    }
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// Creates the parent directory and the documents table if needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CollabError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open the file at `path`, or fall back to an in-memory database
    ///
    /// A corrupt or unreadable file is logged and left untouched; the session
    /// runs with empty keys and no cached flowcharts.
    pub fn open_or_in_memory(path: impl AsRef<Path>) -> Result<Self, CollabError> {
        let path = path.as_ref();
        match Self::new(path) {
            Ok(storage) => Ok(storage),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Storage unreadable, continuing in memory");
                Self::in_memory()
            }
        }
    }

    /// Storage that lives only as long as the process
    pub fn in_memory() -> Result<Self, CollabError> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, CollabError> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(DOCUMENTS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Get a reference to the shared database handle
    ///
    /// The key store shares this connection instead of opening the file twice.
    pub fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Document Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a flowchart snapshot, overwriting any previous one.
    pub fn save_document(
        &self,
        id: &LocalFlowchartId,
        snapshot: &FlowchartSnapshot,
    ) -> Result<(), CollabError> {
        let data = serde_json::to_vec(snapshot)?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            table.insert(id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a flowchart snapshot.
    ///
    /// Returns `None` if nothing was saved for this id.
    pub fn load_document(&self, id: &LocalFlowchartId) -> Result<Option<FlowchartSnapshot>, CollabError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(DOCUMENTS_TABLE)?;

        match table.get(id.as_str())? {
            Some(v) => {
                let snapshot: FlowchartSnapshot = serde_json::from_slice(v.value())?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Remove a cached snapshot.
    pub fn delete_document(&self, id: &LocalFlowchartId) -> Result<(), CollabError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            table.remove(id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Ids of all cached flowcharts.
    pub fn list_documents(&self) -> Result<Vec<LocalFlowchartId>, CollabError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(DOCUMENTS_TABLE)?;

        let mut ids = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            ids.push(LocalFlowchartId::new(key.value()));
        }
        Ok(ids)
    }
}

impl SnapshotCache for Storage {
    fn load(&self, id: &LocalFlowchartId) -> Result<Option<FlowchartSnapshot>, CollabError> {
        self.load_document(id)
    }

    fn store(&self, id: &LocalFlowchartId, snapshot: &FlowchartSnapshot) -> Result<(), CollabError> {
        self.save_document(id, snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Edge, FlowchartProperties, Node, Position};
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path).unwrap();
        (storage, temp_dir)
    }

    fn sample_snapshot() -> FlowchartSnapshot {
        FlowchartSnapshot {
            properties: FlowchartProperties::new("fc1", "Onboarding"),
            nodes: vec![
                Node::new("start", "terminal", Position::new(0.0, 0.0)),
                Node::new("review", "process", Position::new(0.0, 120.0)),
            ],
            edges: vec![Edge::new("e1", "start", "review")],
        }
    }

    #[test]
    fn test_storage_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/path/to/test.redb");
        let storage = Storage::new(&db_path);
        assert!(storage.is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_save_and_load_document() {
        let (storage, _temp) = create_test_storage();
        let id = LocalFlowchartId::new("fc1");

        storage.save_document(&id, &sample_snapshot()).unwrap();

        let loaded = storage.load_document(&id).unwrap().unwrap();
        assert_eq!(loaded, sample_snapshot());
    }

    #[test]
    fn test_load_nonexistent_document() {
        let (storage, _temp) = create_test_storage();
        assert!(storage
            .load_document(&LocalFlowchartId::new("missing"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_document_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let id = LocalFlowchartId::new("fc1");

        {
            let storage = Storage::new(&db_path).unwrap();
            storage.save_document(&id, &sample_snapshot()).unwrap();
        }

        let storage = Storage::new(&db_path).unwrap();
        assert_eq!(storage.load_document(&id).unwrap(), Some(sample_snapshot()));
    }

    #[test]
    fn test_delete_and_list_documents() {
        let storage = Storage::in_memory().unwrap();
        let a = LocalFlowchartId::new("a");
        let b = LocalFlowchartId::new("b");
        storage.save_document(&a, &sample_snapshot()).unwrap();
        storage.save_document(&b, &FlowchartSnapshot::default()).unwrap();
        assert_eq!(storage.list_documents().unwrap().len(), 2);

        storage.delete_document(&a).unwrap();
        assert_eq!(storage.list_documents().unwrap(), vec![b]);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_memory() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("broken.redb");
        std::fs::write(&db_path, vec![0xAB; 8192]).unwrap();
        assert!(Storage::new(&db_path).is_err());

        let storage = Storage::open_or_in_memory(&db_path).unwrap();
        let id = LocalFlowchartId::new("fc1");
        storage.save_document(&id, &sample_snapshot()).unwrap();
        assert_eq!(storage.load_document(&id).unwrap(), Some(sample_snapshot()));

        // The broken file is not overwritten
        assert_eq!(std::fs::read(&db_path).unwrap(), vec![0xAB; 8192]);
    }

    #[test]
    fn test_no_cache_is_empty() {
        let cache = NoCache;
        let id = LocalFlowchartId::new("fc1");
        cache.store(&id, &sample_snapshot()).unwrap();
        assert!(cache.load(&id).unwrap().is_none());
    }
}
