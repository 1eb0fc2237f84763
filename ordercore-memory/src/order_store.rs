use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ordercore_types::{Order, OrderId, OrderStore, StoreError};
use parking_lot::RwLock;

/// Thread-safe in-memory order document store for testing
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderStore {
    documents: Arc<RwLock<HashMap<OrderId, Order>>>,
    // Every write that changed a document, for asserting that replays write nothing
    writes: Arc<AtomicUsize>,
}

impl InMemoryOrderStore {
    /// Create a new empty in-memory order store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes that changed stored state since creation.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    /// Whether no document has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

impl OrderStore for InMemoryOrderStore {
    fn create_if_absent(
        &self,
        order: &Order,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let created = match self.documents.write().entry(order.order_id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(order.clone());
                self.writes.fetch_add(1, Ordering::SeqCst);
                true
            }
        };

        std::future::ready(Ok(created))
    }

    fn get(
        &self,
        order_id: &OrderId,
    ) -> impl Future<Output = Result<Option<Order>, StoreError>> + Send {
        let found = self.documents.read().get(order_id).cloned();
        std::future::ready(Ok(found))
    }

    fn upsert(&self, order: &Order) -> impl Future<Output = Result<Order, StoreError>> + Send {
        self.documents
            .write()
            .insert(order.order_id().clone(), order.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);

        std::future::ready(Ok(order.clone()))
    }

    fn replace_if_unchanged(
        &self,
        current: &Order,
        next: &Order,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let mut documents = self.documents.write();
        let replaced = match documents.get_mut(current.order_id()) {
            Some(stored) if stored == current => {
                *stored = next.clone();
                self.writes.fetch_add(1, Ordering::SeqCst);
                true
            }
            _ => false,
        };
        drop(documents);

        std::future::ready(Ok(replaced))
    }
}
