use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use ordercore_types::{
    HistoryError, HistoryEvent, HistoryStore, HistoryVersion, InstanceHistory, OrderId,
};
use parking_lot::RwLock;

/// Thread-safe in-memory orchestration history store for testing
#[derive(Debug, Clone, Default)]
pub struct InMemoryHistoryStore {
    histories: Arc<RwLock<HashMap<OrderId, Vec<HistoryEvent>>>>,
}

impl InMemoryHistoryStore {
    /// Create a new empty history store
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the history of an instance, e.g. with the prefix of a crashed run.
    pub fn seed(&self, instance_id: &OrderId, events: Vec<HistoryEvent>) {
        self.histories.write().insert(instance_id.clone(), events);
    }

    /// Snapshot of the events recorded for an instance.
    pub fn events(&self, instance_id: &OrderId) -> Vec<HistoryEvent> {
        self.histories
            .read()
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn read_history(
        &self,
        instance_id: &OrderId,
    ) -> impl Future<Output = Result<InstanceHistory, HistoryError>> + Send {
        std::future::ready(Ok(InstanceHistory::new(self.events(instance_id))))
    }

    fn append_history(
        &self,
        instance_id: &OrderId,
        expected: HistoryVersion,
        events: Vec<HistoryEvent>,
    ) -> impl Future<Output = Result<HistoryVersion, HistoryError>> + Send {
        let mut histories = self.histories.write();
        let stored = histories.entry(instance_id.clone()).or_default();
        let actual = HistoryVersion::new(stored.len());

        let result = if actual == expected {
            stored.extend(events);
            Ok(HistoryVersion::new(stored.len()))
        } else {
            Err(HistoryError::VersionConflict {
                instance_id: instance_id.clone(),
                expected,
                actual,
            })
        };

        std::future::ready(result)
    }
}
