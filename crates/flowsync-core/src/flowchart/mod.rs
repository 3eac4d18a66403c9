//! Replicated flowchart state
//!
//! [`ReplicationState`] is the one structure both the network path and local
//! edits mutate. It is a cheap, cloneable handle around a mutex-guarded
//! [`FlowchartDoc`]; every applied mutation is queued for the
//! [`SnapshotCache`] and written off the async threads.

pub mod doc;
mod writer;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::storage::{NoCache, SnapshotCache};
use crate::types::{EdgeOperation, FlowchartSnapshot, LocalFlowchartId, NodeOperation};

pub use doc::{FlowchartDoc, OpOutcome};
use writer::CacheWriter;

/// Shared handle to the authoritative flowchart document
#[derive(Clone)]
pub struct ReplicationState {
    doc: Arc<Mutex<FlowchartDoc>>,
    cache: Arc<CacheWriter>,
}

impl std::fmt::Debug for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let doc = self.doc.lock();
        f.debug_struct("ReplicationState")
            .field("flowchart_id", doc.flowchart_id())
            .field("nodes", &doc.nodes().len())
            .field("edges", &doc.edges().len())
            .finish()
    }
}

impl ReplicationState {
    /// Uncached state, starting empty
    pub fn new(flowchart_id: LocalFlowchartId) -> Self {
        Self {
            doc: Arc::new(Mutex::new(FlowchartDoc::new(flowchart_id))),
            cache: Arc::new(CacheWriter::inline(Arc::new(NoCache))),
        }
    }

    /// State seeded from the cache's copy of `flowchart_id`, if any
    ///
    /// Inside a tokio runtime, writes go through a background task and
    /// [`flush`](Self::flush) waits for them; elsewhere they are synchronous.
    pub fn open(flowchart_id: LocalFlowchartId, cache: Arc<dyn SnapshotCache>) -> Self {
        let cache = Arc::new(CacheWriter::spawn(cache));
        let doc = load_doc(&cache, flowchart_id);
        Self {
            doc: Arc::new(Mutex::new(doc)),
            cache,
        }
    }

    pub fn flowchart_id(&self) -> LocalFlowchartId {
        self.doc.lock().flowchart_id().clone()
    }

    /// Wall-clock time of the last mutation (unix ms)
    pub fn updated_at(&self) -> i64 {
        self.doc.lock().updated_at()
    }

    /// Point the state at another flowchart, loading its cached copy
    ///
    /// No-op when already bound to `flowchart_id`.
    pub fn switch_to(&self, flowchart_id: LocalFlowchartId) {
        let mut doc = self.doc.lock();
        if doc.flowchart_id() == &flowchart_id {
            return;
        }
        *doc = load_doc(&self.cache, flowchart_id);
    }

    /// Edge-consistent copy of the current document
    pub fn snapshot(&self) -> FlowchartSnapshot {
        self.doc.lock().snapshot()
    }

    /// No nodes and no edges
    pub fn is_empty(&self) -> bool {
        self.with_doc(|doc| doc.nodes().is_empty() && doc.edges().is_empty())
    }

    /// Read the document under the lock
    pub fn with_doc<R>(&self, f: impl FnOnce(&FlowchartDoc) -> R) -> R {
        f(&self.doc.lock())
    }

    /// Atomically replace the document; returns the number of dropped edges
    pub fn apply_snapshot(&self, snapshot: FlowchartSnapshot) -> usize {
        let mut doc = self.doc.lock();
        let dropped = doc.apply_snapshot(snapshot);
        if dropped > 0 {
            debug!(flowchart = %doc.flowchart_id(), dropped, "Dropped dangling edges from snapshot");
        }
        self.write_back(&doc);
        dropped
    }

    pub fn apply_node_op(&self, op: &NodeOperation) -> OpOutcome {
        let mut doc = self.doc.lock();
        let outcome = doc.apply_node_op(op);
        if outcome.is_applied() {
            self.write_back(&doc);
        }
        outcome
    }

    pub fn apply_edge_op(&self, op: &EdgeOperation) -> OpOutcome {
        let mut doc = self.doc.lock();
        let outcome = doc.apply_edge_op(op);
        if outcome.is_applied() {
            self.write_back(&doc);
        }
        outcome
    }

    /// Rename the flowchart
    pub fn set_name(&self, name: impl Into<String>) {
        let mut doc = self.doc.lock();
        doc.set_name(name);
        self.write_back(&doc);
    }

    /// Wait until every mutation so far has reached the cache
    pub async fn flush(&self) {
        self.cache.flush().await;
    }

    // Runs under the document lock so queued snapshots follow mutation order.
    fn write_back(&self, doc: &FlowchartDoc) {
        self.cache.store(doc.flowchart_id(), doc.snapshot());
    }
}

fn load_doc(cache: &CacheWriter, flowchart_id: LocalFlowchartId) -> FlowchartDoc {
    match cache.load(&flowchart_id) {
        Ok(Some(snapshot)) => FlowchartDoc::from_snapshot(flowchart_id, snapshot),
        Ok(None) => FlowchartDoc::new(flowchart_id),
        Err(e) => {
            warn!(flowchart = %flowchart_id, error = %e, "Failed to read cached flowchart, starting empty");
            FlowchartDoc::new(flowchart_id)
        }
    }
}
