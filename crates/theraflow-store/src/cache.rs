//! In-memory mirror of one collection for the bound identity.
//!
//! Reads are synchronous and return copies. Mutations apply to the local
//! state and publish a change event before returning; the matching remote
//! write runs in the background. Snapshots from the store replace the whole
//! collection.
//!
//! Every identity binding gets a fresh epoch. Deliveries and restores tagged
//! with an older epoch are dropped, so nothing from a previous identity can
//! reach the cache after it was rebound.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

use crate::bus::ChangeBus;
use crate::error::{StoreError, SyncError};
use crate::records::Entity;
use crate::remote::RemoteStore;
use crate::types::{Document, OwnerId, StoredDocument};
use crate::write::{PendingWrite, WriteFailure, WriteOp};

/// The identity a cache is bound to, and the epoch of that binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub owner: OwnerId,
    pub epoch: u64,
}

/// A record taken out of the cache, with enough context to put it back.
#[derive(Debug, Clone)]
pub struct Removed<E> {
    pub entity: E,
    index: usize,
    epoch: u64,
}

struct CacheState<E> {
    owner: Option<OwnerId>,
    epoch: u64,
    entries: Vec<E>,
}

/// Cache of one entity type.
pub struct CollectionCache<E: Entity> {
    state: RwLock<CacheState<E>>,
    bus: Arc<ChangeBus>,
    remote: Arc<dyn RemoteStore>,
    runtime: Handle,
    failures: broadcast::Sender<WriteFailure>,
    restore_on_failed_delete: bool,
}

impl<E: Entity> CollectionCache<E> {
    pub(crate) fn new(
        bus: Arc<ChangeBus>,
        remote: Arc<dyn RemoteStore>,
        runtime: Handle,
        failures: broadcast::Sender<WriteFailure>,
        restore_on_failed_delete: bool,
    ) -> Self {
        Self {
            state: RwLock::new(CacheState {
                owner: None,
                epoch: 0,
                entries: Vec::new(),
            }),
            bus,
            remote,
            runtime,
            failures,
            restore_on_failed_delete,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState<E>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState<E>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Copy of the current contents.
    pub fn list(&self) -> Vec<E> {
        self.read().entries.clone()
    }

    pub fn find_by_id(&self, id: &str) -> Option<E> {
        self.read().entries.iter().find(|e| e.id() == id).cloned()
    }

    pub fn filter_by(&self, predicate: impl Fn(&E) -> bool) -> Vec<E> {
        self.read()
            .entries
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    pub(crate) fn binding(&self) -> Option<Binding> {
        let state = self.read();
        state.owner.clone().map(|owner| Binding {
            owner,
            epoch: state.epoch,
        })
    }

    // =========================================================================
    // Optimistic mutations
    // =========================================================================

    /// Insert or replace a record, then write it to the store.
    ///
    /// The record is stamped with the bound identity as `ownerId` and, if it
    /// has none, a creation time. A record already cached under the same
    /// identifier is replaced in place; a new one goes first.
    pub fn upsert(&self, mut entity: E) -> PendingWrite {
        if entity.id().is_empty() {
            return PendingWrite::ready(Err(SyncError::MissingId(E::ID_FIELD)));
        }

        {
            let mut state = self.write();
            let Some(owner) = state.owner.clone() else {
                drop(state);
                warn!(collection = %E::COLLECTION, id = %entity.id(), "write rejected: signed out");
                return PendingWrite::ready(Err(SyncError::SignedOut));
            };
            entity.set_owner_id(owner);
            if entity.created_at().is_none() {
                entity.set_created_at(Utc::now());
            }
            match state.entries.iter().position(|e| e.id() == entity.id()) {
                Some(index) => state.entries[index] = entity.clone(),
                None => state.entries.insert(0, entity.clone()),
            }
        }
        trace!(collection = %E::COLLECTION, id = %entity.id(), "cache: record upserted");
        self.bus.publish(E::TOPIC);

        let id = entity.id().to_string();
        match entity.to_document() {
            Ok(document) => self.spawn_put(id, document),
            Err(e) => {
                let error = StoreError::from(e);
                report_failure(&self.failures, &id, WriteOp::Put, &error, E::COLLECTION);
                PendingWrite::ready(Err(SyncError::Store(error)))
            }
        }
    }

    /// Remove a record, then delete it from the store.
    ///
    /// If the store rejects the delete and restoring is enabled, the record
    /// goes back where it was.
    pub fn remove(self: &Arc<Self>, id: &str) -> PendingWrite {
        if id.is_empty() {
            return PendingWrite::ready(Err(SyncError::MissingId(E::ID_FIELD)));
        }
        if self.binding().is_none() {
            warn!(collection = %E::COLLECTION, id = %id, "delete rejected: signed out");
            return PendingWrite::ready(Err(SyncError::SignedOut));
        }
        let removed = self.remove_local(id);
        let cache = Arc::clone(self);
        let id = id.to_string();
        PendingWrite::spawned(self.runtime.spawn(async move {
            let result = cache.remote.delete(E::COLLECTION, &id).await;
            if result.is_err()
                && cache.restore_on_failed_delete
                && let Some(removed) = removed
            {
                cache.restore(removed);
            }
            settle(result, &cache.failures, &id, WriteOp::Delete, E::COLLECTION)
        }))
    }

    /// Take a record out of the cache and publish. The record is returned
    /// if it was cached.
    pub(crate) fn remove_local(&self, id: &str) -> Option<Removed<E>> {
        let removed = {
            let mut state = self.write();
            let epoch = state.epoch;
            state
                .entries
                .iter()
                .position(|e| e.id() == id)
                .map(|index| Removed {
                    entity: state.entries.remove(index),
                    index,
                    epoch,
                })
        };
        trace!(collection = %E::COLLECTION, id = %id, found = removed.is_some(), "cache: record removed");
        self.bus.publish(E::TOPIC);
        removed
    }

    /// Put back a record removed by [`remove_local`](Self::remove_local).
    ///
    /// Skipped if the cache was rebound since, or if the identifier is
    /// cached again (a newer snapshot or write already decided its state).
    pub(crate) fn restore(&self, removed: Removed<E>) -> bool {
        {
            let mut state = self.write();
            if state.epoch != removed.epoch
                || state.entries.iter().any(|e| e.id() == removed.entity.id())
            {
                return false;
            }
            let index = removed.index.min(state.entries.len());
            state.entries.insert(index, removed.entity);
        }
        debug!(collection = %E::COLLECTION, "cache: optimistic delete rolled back");
        self.bus.publish(E::TOPIC);
        true
    }

    /// Drop every record matching `predicate` if the cache is still at
    /// `epoch`, and publish. Returns how many were dropped.
    pub(crate) fn remove_where(&self, epoch: u64, predicate: impl Fn(&E) -> bool) -> usize {
        let removed = {
            let mut state = self.write();
            if state.epoch != epoch {
                return 0;
            }
            let before = state.entries.len();
            state.entries.retain(|e| !predicate(e));
            before - state.entries.len()
        };
        trace!(collection = %E::COLLECTION, removed, "cache: records removed");
        self.bus.publish(E::TOPIC);
        removed
    }

    // =========================================================================
    // Subscription side
    // =========================================================================

    /// Empty the cache and bind it to `owner` under a new epoch.
    ///
    /// Nothing is published; the caller announces the transition once the
    /// rebinding of every cache is done.
    pub(crate) fn rebind(&self, owner: Option<OwnerId>) -> u64 {
        let mut state = self.write();
        state.entries.clear();
        state.owner = owner;
        state.epoch += 1;
        debug!(collection = %E::COLLECTION, epoch = state.epoch, "cache: rebound");
        state.epoch
    }

    /// Replace the contents with a snapshot delivered for `epoch`.
    ///
    /// Documents owned by anyone but the bound identity are discarded. Other
    /// fields are decoded leniently, so an owned document is always kept.
    pub(crate) fn apply_snapshot(&self, epoch: u64, docs: Vec<StoredDocument>) {
        let owner = {
            let state = self.read();
            match (&state.owner, state.epoch == epoch) {
                (Some(owner), true) => owner.clone(),
                _ => {
                    trace!(collection = %E::COLLECTION, epoch, "ignoring stale snapshot");
                    return;
                }
            }
        };

        let total = docs.len();
        let mut entries = Vec::with_capacity(total);
        for doc in docs {
            if doc.owner_id() != Some(owner.as_str()) {
                warn!(
                    collection = %E::COLLECTION,
                    id = %doc.id,
                    owner = %owner,
                    "discarding record outside the bound identity"
                );
                continue;
            }
            let id = doc.id.clone();
            match E::from_document(doc) {
                Ok(entity) => entries.push(entity),
                Err(e) => {
                    warn!(collection = %E::COLLECTION, id = %id, error = %e, "skipping undecodable record")
                }
            }
        }

        {
            let mut state = self.write();
            if state.epoch != epoch {
                trace!(collection = %E::COLLECTION, epoch, "snapshot superseded while decoding");
                return;
            }
            state.entries = entries;
        }
        debug!(collection = %E::COLLECTION, epoch, total, kept = self.len(), "cache: snapshot applied");
        self.bus.publish(E::TOPIC);
    }

    /// Log a subscription error. The last good contents stay in place.
    pub(crate) fn subscription_error(&self, epoch: u64, error: StoreError) {
        if self.read().epoch != epoch {
            trace!(collection = %E::COLLECTION, epoch, error = %error, "ignoring error from stale subscription");
            return;
        }
        error!(collection = %E::COLLECTION, error = %error, "snapshot subscription error");
    }

    // =========================================================================
    // Remote writes
    // =========================================================================

    fn spawn_put(&self, id: String, document: Document) -> PendingWrite {
        let remote = Arc::clone(&self.remote);
        let failures = self.failures.clone();
        PendingWrite::spawned(self.runtime.spawn(async move {
            let result = remote.put(E::COLLECTION, &id, document).await;
            settle(result, &failures, &id, WriteOp::Put, E::COLLECTION)
        }))
    }
}

fn settle(
    result: Result<(), StoreError>,
    failures: &broadcast::Sender<WriteFailure>,
    id: &str,
    operation: WriteOp,
    collection: crate::types::Collection,
) -> Result<(), SyncError> {
    match result {
        Ok(()) => {
            trace!(collection = %collection, id = %id, ?operation, "remote write acknowledged");
            Ok(())
        }
        Err(error) => {
            report_failure(failures, id, operation, &error, collection);
            Err(SyncError::Store(error))
        }
    }
}

fn report_failure(
    failures: &broadcast::Sender<WriteFailure>,
    id: &str,
    operation: WriteOp,
    error: &StoreError,
    collection: crate::types::Collection,
) {
    warn!(collection = %collection, id = %id, ?operation, error = %error, "remote write failed");
    let failure = WriteFailure {
        collection,
        id: id.to_string(),
        operation,
        error: error.clone(),
    };
    if failures.send(failure).is_err() {
        trace!("no subscribers for write failure");
    }
}
