use std::future::Future;

use crate::order::{Order, OrderId};

/// Trait defining the contract for order document stores.
///
/// The store is keyed by [`OrderId`] and provides four operations:
/// 1. Atomic create-if-absent, the basis of idempotent intake
/// 2. Point reads by id
/// 3. Whole-document upsert (last writer wins)
/// 4. Compare-and-swap replacement, for writes that must not overwrite a
///    concurrent change
///
/// Implementations include:
/// - `ordercore-postgres`: Production PostgreSQL backend
/// - `ordercore-memory`: In-memory backend for testing
pub trait OrderStore: Send + Sync {
    /// Insert the order unless a document with the same id already exists.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The document was created by this call
    /// * `Ok(false)` - A document with this id already existed; nothing was written
    ///
    /// Under concurrent calls with the same id exactly one caller observes `true`.
    fn create_if_absent(
        &self,
        order: &Order,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Fetch the current document, or `None` if the id is unknown.
    fn get(
        &self,
        order_id: &OrderId,
    ) -> impl Future<Output = Result<Option<Order>, StoreError>> + Send;

    /// Insert or replace the document and return what was stored.
    fn upsert(&self, order: &Order) -> impl Future<Output = Result<Order, StoreError>> + Send;

    /// Replace the stored document with `next` only if it still equals
    /// `current`.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The document matched `current` and now holds `next`
    /// * `Ok(false)` - The document is missing or was changed by another
    ///   writer; nothing was written
    fn replace_if_unchanged(
        &self,
        current: &Order,
        next: &Order,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// Identifies the store operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// `create_if_absent`
    CreateIfAbsent,
    /// `get`
    Get,
    /// `upsert`
    Upsert,
    /// `replace_if_unchanged`
    ReplaceIfUnchanged,
}

impl std::fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateIfAbsent => write!(f, "create_if_absent"),
            Self::Get => write!(f, "get"),
            Self::Upsert => write!(f, "upsert"),
            Self::ReplaceIfUnchanged => write!(f, "replace_if_unchanged"),
        }
    }
}

/// Error type returned by order store operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or rejected the operation for
    /// infrastructure reasons. Retrying may succeed.
    #[error("{operation} operation failed: {detail}")]
    Unavailable {
        /// The operation that failed.
        operation: StoreOperation,
        /// Backend specific detail.
        detail: String,
    },

    /// The order could not be encoded for storage.
    #[error("failed to serialize order {order_id}: {detail}")]
    SerializationFailed {
        /// The order being written.
        order_id: OrderId,
        /// Serializer message.
        detail: String,
    },

    /// A stored document could not be decoded.
    #[error("failed to deserialize order {order_id}: {detail}")]
    DeserializationFailed {
        /// The order being read.
        order_id: OrderId,
        /// Deserializer message.
        detail: String,
    },
}

impl StoreError {
    /// Build an [`StoreError::Unavailable`] from any displayable cause.
    pub fn unavailable(operation: StoreOperation, detail: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            operation,
            detail: detail.to_string(),
        }
    }

    /// Whether retrying the operation may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
