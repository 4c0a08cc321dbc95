//! Remote store adapter contract.
//!
//! A real-time document store offering equality-filtered queries, live
//! snapshot subscriptions, single-document writes and batched deletes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{Collection, Document, Filter, StoredDocument};

/// Callback receiving the full current member set of a subscription.
pub type SnapshotCallback = Arc<dyn Fn(Vec<StoredDocument>) + Send + Sync>;

/// Callback receiving subscription errors.
pub type ErrorCallback = Arc<dyn Fn(StoreError) + Send + Sync>;

/// Handle to a live subscription. Dropping it stops the subscription.
#[must_use = "dropping a subscription handle stops the subscription"]
pub struct SubscriptionHandle {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    /// Create a handle that runs `stop` when unsubscribed or dropped.
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    /// Stop receiving updates.
    pub fn unsubscribe(mut self) {
        self.stop_now();
    }

    fn stop_now(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.stop_now();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("live", &self.stop.is_some())
            .finish()
    }
}

/// A remote document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Open a live subscription on the documents of `collection` matching
    /// `filter`. Snapshots are delivered in order, each one the complete
    /// current member set.
    fn subscribe(
        &self,
        collection: Collection,
        filter: Filter,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> Result<SubscriptionHandle, StoreError>;

    /// Create or replace the document with the given identifier.
    async fn put(&self, collection: Collection, id: &str, document: Document)
    -> Result<(), StoreError>;

    /// Delete a document. Deleting a missing document succeeds.
    async fn delete(&self, collection: Collection, id: &str) -> Result<(), StoreError>;

    /// One-shot read of every document matching `filter`.
    async fn query(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<StoredDocument>, StoreError>;

    /// Delete every listed document atomically.
    async fn batch_delete(&self, collection: Collection, ids: &[String])
    -> Result<(), StoreError>;

    /// One-shot read of a single document.
    async fn get(&self, collection: Collection, id: &str)
    -> Result<Option<StoredDocument>, StoreError>;
}
