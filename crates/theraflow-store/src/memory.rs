//! In-memory remote store.
//!
//! A complete [`RemoteStore`] kept in process memory. Filters are applied
//! server-side, a new subscription receives its first snapshot before
//! `subscribe` returns, and every write fans a fresh snapshot out to the
//! affected subscriptions. Snapshots reach each subscription in write order.
//!
//! Tests use the extra knobs: artificial latency, injected failures, and raw
//! snapshot pushes that bypass filtering.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::remote::{ErrorCallback, RemoteStore, SnapshotCallback, SubscriptionHandle};
use crate::types::{CREATED_AT_FIELD, Collection, Document, Filter, StoredDocument};

/// Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Subscribe,
    Put,
    Delete,
    Query,
    BatchDelete,
    Get,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Subscribe => "subscribe",
            Operation::Put => "put",
            Operation::Delete => "delete",
            Operation::Query => "query",
            Operation::BatchDelete => "batch delete",
            Operation::Get => "get",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct CollectionData {
    /// Bumped on every change; orders snapshot deliveries.
    version: u64,
    docs: BTreeMap<String, Document>,
}

struct Listener {
    collection: Collection,
    filter: Filter,
    on_snapshot: SnapshotCallback,
    on_error: ErrorCallback,
    /// Version of the last delivered snapshot. Held while delivering.
    delivered: Mutex<Option<u64>>,
}

impl Listener {
    fn deliver(&self, version: u64, docs: Vec<StoredDocument>) {
        let mut delivered = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        if delivered.is_some_and(|last| version <= last) {
            trace!(collection = %self.collection, version, "skipping superseded snapshot");
            return;
        }
        *delivered = Some(version);
        (self.on_snapshot)(docs);
    }
}

type PendingDelivery = (Arc<Listener>, u64, Vec<StoredDocument>);

/// In-memory real-time document store.
pub struct MemoryStore {
    collections: DashMap<Collection, CollectionData>,
    listeners: Arc<DashMap<u64, Arc<Listener>>>,
    next_listener: AtomicU64,
    failures: DashMap<Operation, usize>,
    latency: Option<Duration>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            listeners: Arc::new(DashMap::new()),
            next_listener: AtomicU64::new(1),
            failures: DashMap::new(),
            latency: None,
        }
    }

    /// Delay every asynchronous operation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next `times` calls of `operation` fail as unavailable.
    pub fn fail_next(&self, operation: Operation, times: usize) {
        *self.failures.entry(operation).or_insert(0) += times;
    }

    /// Insert a document directly, notifying subscriptions.
    pub fn seed(&self, collection: Collection, id: impl Into<String>, document: Document) {
        let id = id.into();
        let pending = self.mutate(collection, |data| {
            data.docs.insert(id, document);
            true
        });
        Self::deliver_all(pending);
    }

    /// Deliver `docs` as a snapshot to every subscription on `collection`,
    /// bypassing filters. Simulates an adapter that cannot filter server-side.
    pub fn push_snapshot(&self, collection: Collection, docs: Vec<StoredDocument>) {
        let version = {
            let mut data = self.collections.entry(collection).or_default();
            data.version += 1;
            data.version
        };
        let pending: Vec<PendingDelivery> = self
            .listeners_for(collection)
            .into_iter()
            .map(|listener| (listener, version, docs.clone()))
            .collect();
        Self::deliver_all(pending);
    }

    /// Report `error` to every subscription on `collection`.
    pub fn fail_subscriptions(&self, collection: Collection, error: StoreError) {
        for listener in self.listeners_for(collection) {
            (listener.on_error)(error.clone());
        }
    }

    /// Current body of a document.
    pub fn document(&self, collection: Collection, id: &str) -> Option<Document> {
        self.collections
            .get(&collection)
            .and_then(|data| data.docs.get(id).cloned())
    }

    /// Identifiers of every document in a collection, in key order.
    pub fn ids(&self, collection: Collection) -> Vec<String> {
        self.collections
            .get(&collection)
            .map(|data| data.docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live subscriptions on a collection.
    pub fn listener_count(&self, collection: Collection) -> usize {
        self.listeners
            .iter()
            .filter(|l| l.value().collection == collection)
            .count()
    }

    fn check(&self, operation: Operation, collection: Collection) -> Result<(), StoreError> {
        if let Some(mut remaining) = self.failures.get_mut(&operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(StoreError::Unavailable(format!(
                "injected {} failure on {}",
                operation, collection
            )));
        }
        Ok(())
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn listeners_for(&self, collection: Collection) -> Vec<Arc<Listener>> {
        self.listeners
            .iter()
            .filter(|l| l.value().collection == collection)
            .map(|l| Arc::clone(l.value()))
            .collect()
    }

    fn matching(docs: &BTreeMap<String, Document>, filter: &Filter) -> Vec<StoredDocument> {
        docs.iter()
            .filter(|(_, doc)| filter.matches(doc))
            .map(|(id, doc)| StoredDocument::new(id.clone(), doc.clone()))
            .collect()
    }

    /// Apply `change` under the collection lock and compute the snapshots it
    /// produces. `change` returns whether anything changed.
    fn mutate(
        &self,
        collection: Collection,
        change: impl FnOnce(&mut CollectionData) -> bool,
    ) -> Vec<PendingDelivery> {
        let mut data = self.collections.entry(collection).or_default();
        if !change(data.value_mut()) {
            return Vec::new();
        }
        data.version += 1;
        let version = data.version;
        self.listeners_for(collection)
            .into_iter()
            .map(|listener| {
                let docs = Self::matching(&data.docs, &listener.filter);
                (listener, version, docs)
            })
            .collect()
    }

    fn deliver_all(pending: Vec<PendingDelivery>) {
        for (listener, version, docs) in pending {
            listener.deliver(version, docs);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn subscribe(
        &self,
        collection: Collection,
        filter: Filter,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> Result<SubscriptionHandle, StoreError> {
        self.check(Operation::Subscribe, collection)?;

        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        let listener = Arc::new(Listener {
            collection,
            filter,
            on_snapshot,
            on_error,
            delivered: Mutex::new(None),
        });
        self.listeners.insert(id, Arc::clone(&listener));
        debug!(collection = %collection, listener = id, "memory store: subscribed");

        let (version, docs) = {
            let data = self.collections.entry(collection).or_default();
            (data.version, Self::matching(&data.docs, &listener.filter))
        };
        listener.deliver(version, docs);

        let listeners = Arc::clone(&self.listeners);
        Ok(SubscriptionHandle::new(move || {
            listeners.remove(&id);
            debug!(collection = %collection, listener = id, "memory store: unsubscribed");
        }))
    }

    async fn put(
        &self,
        collection: Collection,
        id: &str,
        mut document: Document,
    ) -> Result<(), StoreError> {
        self.pause().await;
        self.check(Operation::Put, collection)?;

        if !document.contains_key(CREATED_AT_FIELD) {
            document.insert(
                CREATED_AT_FIELD.to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }

        let pending = self.mutate(collection, |data| {
            data.docs.insert(id.to_string(), document);
            true
        });
        Self::deliver_all(pending);
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), StoreError> {
        self.pause().await;
        self.check(Operation::Delete, collection)?;

        let pending = self.mutate(collection, |data| data.docs.remove(id).is_some());
        Self::deliver_all(pending);
        Ok(())
    }

    async fn query(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        self.pause().await;
        self.check(Operation::Query, collection)?;

        Ok(self
            .collections
            .get(&collection)
            .map(|data| Self::matching(&data.docs, filter))
            .unwrap_or_default())
    }

    async fn batch_delete(&self, collection: Collection, ids: &[String]) -> Result<(), StoreError> {
        self.pause().await;
        self.check(Operation::BatchDelete, collection)?;

        let pending = self.mutate(collection, |data| {
            let mut changed = false;
            for id in ids {
                changed |= data.docs.remove(id).is_some();
            }
            changed
        });
        Self::deliver_all(pending);
        Ok(())
    }

    async fn get(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        self.pause().await;
        self.check(Operation::Get, collection)?;

        Ok(self
            .document(collection, id)
            .map(|doc| StoredDocument::new(id, doc)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn recording() -> (Arc<Mutex<Vec<Vec<String>>>>, SnapshotCallback, ErrorCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let on_snapshot: SnapshotCallback = Arc::new(move |docs: Vec<StoredDocument>| {
            sink.lock()
                .unwrap()
                .push(docs.into_iter().map(|d| d.id).collect());
        });
        let on_error: ErrorCallback = Arc::new(|_| {});
        (seen, on_snapshot, on_error)
    }

    #[tokio::test]
    async fn test_subscribe_delivers_initial_filtered_snapshot() {
        let store = MemoryStore::new();
        store.seed(Collection::Patients, "p1", doc(json!({"ownerId": "u1"})));
        store.seed(Collection::Patients, "p2", doc(json!({"ownerId": "u2"})));

        let (seen, on_snapshot, on_error) = recording();
        let _handle = store
            .subscribe(
                Collection::Patients,
                Filter::new().eq("ownerId", "u1"),
                on_snapshot,
                on_error,
            )
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![vec!["p1".to_string()]]);
    }

    #[tokio::test]
    async fn test_writes_fan_out_snapshots() {
        let store = MemoryStore::new();
        let (seen, on_snapshot, on_error) = recording();
        let handle = store
            .subscribe(
                Collection::Sessions,
                Filter::new().eq("ownerId", "u1"),
                on_snapshot,
                on_error,
            )
            .unwrap();

        store
            .put(Collection::Sessions, "s1", doc(json!({"ownerId": "u1"})))
            .await
            .unwrap();
        store
            .put(Collection::Sessions, "s2", doc(json!({"ownerId": "u2"})))
            .await
            .unwrap();
        store.delete(Collection::Sessions, "s1").await.unwrap();
        // Deleting a missing document changes nothing.
        store.delete(Collection::Sessions, "s1").await.unwrap();

        handle.unsubscribe();
        store
            .put(Collection::Sessions, "s3", doc(json!({"ownerId": "u1"})))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                vec![],
                vec!["s1".to_string()],
                vec!["s1".to_string()],
                vec![],
            ]
        );
        assert_eq!(store.listener_count(Collection::Sessions), 0);
    }

    #[tokio::test]
    async fn test_put_assigns_created_at() {
        let store = MemoryStore::new();
        store
            .put(Collection::Patients, "p1", doc(json!({"ownerId": "u1"})))
            .await
            .unwrap();
        store
            .put(
                Collection::Patients,
                "p2",
                doc(json!({"ownerId": "u1", "createdAt": "2020-01-01T00:00:00Z"})),
            )
            .await
            .unwrap();

        let p1 = store.document(Collection::Patients, "p1").unwrap();
        assert!(p1.get("createdAt").and_then(Value::as_str).is_some());
        let p2 = store.document(Collection::Patients, "p2").unwrap();
        assert_eq!(p2.get("createdAt"), Some(&json!("2020-01-01T00:00:00Z")));
    }

    #[tokio::test]
    async fn test_query_and_batch_delete() {
        let store = MemoryStore::new();
        for (id, patient) in [("s1", "p1"), ("s2", "p1"), ("s3", "p2")] {
            store.seed(
                Collection::Sessions,
                id,
                doc(json!({"ownerId": "u1", "patientId": patient})),
            );
        }

        let filter = Filter::new().eq("patientId", "p1").eq("ownerId", "u1");
        let found = store.query(Collection::Sessions, &filter).await.unwrap();
        let ids: Vec<String> = found.into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["s1", "s2"]);

        store
            .batch_delete(Collection::Sessions, &ids)
            .await
            .unwrap();
        assert_eq!(store.ids(Collection::Sessions), vec!["s3"]);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next(Operation::BatchDelete, 1);
        store.seed(Collection::Sessions, "s1", doc(json!({"ownerId": "u1"})));

        let ids = vec!["s1".to_string()];
        let err = store.batch_delete(Collection::Sessions, &ids).await;
        assert!(matches!(err, Err(StoreError::Unavailable(_))));
        // Nothing was deleted by the failed batch.
        assert_eq!(store.ids(Collection::Sessions), vec!["s1"]);

        store.batch_delete(Collection::Sessions, &ids).await.unwrap();
        assert!(store.ids(Collection::Sessions).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_failure() {
        let store = MemoryStore::new();
        store.fail_next(Operation::Subscribe, 1);
        let (_, on_snapshot, on_error) = recording();

        let result = store.subscribe(Collection::Patients, Filter::new(), on_snapshot, on_error);
        assert!(result.is_err());
        assert_eq!(store.listener_count(Collection::Patients), 0);
    }

    #[tokio::test]
    async fn test_push_snapshot_bypasses_filter() {
        let store = MemoryStore::new();
        let (seen, on_snapshot, on_error) = recording();
        let _handle = store
            .subscribe(
                Collection::Patients,
                Filter::new().eq("ownerId", "u1"),
                on_snapshot,
                on_error,
            )
            .unwrap();

        store.push_snapshot(
            Collection::Patients,
            vec![StoredDocument::new("px", doc(json!({"ownerId": "u9"})))],
        );

        assert_eq!(
            *seen.lock().unwrap(),
            vec![vec![], vec!["px".to_string()]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency() {
        let store = MemoryStore::new().with_latency(Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        store.get(Collection::Users, "u1").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_get() {
        let store = MemoryStore::new();
        store.seed(Collection::Users, "u1", doc(json!({"email": "a@b.c"})));

        let found = store.get(Collection::Users, "u1").await.unwrap().unwrap();
        assert_eq!(found.id, "u1");
        assert!(store.get(Collection::Users, "u2").await.unwrap().is_none());
    }
}
