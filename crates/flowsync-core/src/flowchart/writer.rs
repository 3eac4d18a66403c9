//! Write-behind for flowchart snapshots
//!
//! Mutations only record the latest snapshot per flowchart; a background
//! task writes them out on the blocking pool. Reads consult the unwritten
//! set first, so switching back to a flowchart never sees an older copy.
//! Outside a tokio runtime every write happens inline.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::CollabError;
use crate::storage::SnapshotCache;
use crate::types::{FlowchartSnapshot, LocalFlowchartId};

#[derive(Clone)]
struct Unwritten {
    generation: u64,
    snapshot: Arc<FlowchartSnapshot>,
}

#[derive(Default)]
struct UnwrittenSet {
    next_generation: u64,
    entries: HashMap<LocalFlowchartId, Unwritten>,
}

enum Wake {
    Dirty,
    Flush(oneshot::Sender<()>),
}

pub(crate) struct CacheWriter {
    cache: Arc<dyn SnapshotCache>,
    unwritten: Arc<Mutex<UnwrittenSet>>,
    wake: Option<mpsc::UnboundedSender<Wake>>,
}

impl CacheWriter {
    /// Writer with a background task when called inside a runtime
    pub(crate) fn spawn(cache: Arc<dyn SnapshotCache>) -> Self {
        let unwritten = Arc::new(Mutex::new(UnwrittenSet::default()));
        let wake = Handle::try_current().ok().map(|handle| {
            let (tx, rx) = mpsc::unbounded_channel();
            handle.spawn(drain(cache.clone(), unwritten.clone(), rx));
            tx
        });
        Self {
            cache,
            unwritten,
            wake,
        }
    }

    /// Writer that stores synchronously
    pub(crate) fn inline(cache: Arc<dyn SnapshotCache>) -> Self {
        Self {
            cache,
            unwritten: Arc::default(),
            wake: None,
        }
    }

    pub(crate) fn load(&self, id: &LocalFlowchartId) -> Result<Option<FlowchartSnapshot>, CollabError> {
        if let Some(entry) = self.unwritten.lock().entries.get(id) {
            return Ok(Some((*entry.snapshot).clone()));
        }
        self.cache.load(id)
    }

    pub(crate) fn store(&self, id: &LocalFlowchartId, snapshot: FlowchartSnapshot) {
        let Some(wake) = &self.wake else {
            store_logged(&*self.cache, id, &snapshot);
            return;
        };
        {
            let mut unwritten = self.unwritten.lock();
            unwritten.next_generation += 1;
            let generation = unwritten.next_generation;
            unwritten.entries.insert(
                id.clone(),
                Unwritten {
                    generation,
                    snapshot: Arc::new(snapshot),
                },
            );
        }
        if wake.send(Wake::Dirty).is_err() {
            // Runtime is gone; nothing will drain the set
            if let Some(entry) = self.unwritten.lock().entries.remove(id) {
                store_logged(&*self.cache, id, &entry.snapshot);
            }
        }
    }

    /// Resolves once everything stored before the call is written
    pub(crate) async fn flush(&self) {
        let Some(wake) = &self.wake else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if wake.send(Wake::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

fn store_logged(cache: &dyn SnapshotCache, id: &LocalFlowchartId, snapshot: &FlowchartSnapshot) {
    if let Err(e) = cache.store(id, snapshot) {
        warn!(flowchart = %id, error = %e, "Failed to cache flowchart snapshot");
    }
}

async fn drain(
    cache: Arc<dyn SnapshotCache>,
    unwritten: Arc<Mutex<UnwrittenSet>>,
    mut wake: mpsc::UnboundedReceiver<Wake>,
) {
    while let Some(first) = wake.recv().await {
        let mut waiters = Vec::new();
        let mut next = Some(first);
        while let Some(signal) = next {
            if let Wake::Flush(tx) = signal {
                waiters.push(tx);
            }
            next = wake.try_recv().ok();
        }

        let batch: Vec<(LocalFlowchartId, Unwritten)> = unwritten
            .lock()
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        if !batch.is_empty() {
            let store = cache.clone();
            let written = tokio::task::spawn_blocking(move || {
                for (id, entry) in &batch {
                    store_logged(&*store, id, &entry.snapshot);
                }
                batch
            })
            .await;
            match written {
                Ok(batch) => {
                    let mut unwritten = unwritten.lock();
                    for (id, entry) in batch {
                        // Newer snapshots stored meanwhile stay queued
                        if unwritten
                            .entries
                            .get(&id)
                            .is_some_and(|current| current.generation == entry.generation)
                        {
                            unwritten.entries.remove(&id);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Snapshot cache write did not complete"),
            }
        }

        for tx in waiters {
            let _ = tx.send(());
        }
    }
    debug!("Snapshot cache writer stopped");
}
