//! Binds the collection caches to the current identity.
//!
//! The manager owns one cache per entity type and at most one live
//! subscription for each. Binding a different identity stops the old
//! subscriptions, empties and rebinds the caches, announces the change on
//! the bus and opens subscriptions filtered to the new owner.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

use crate::bus::ChangeBus;
use crate::cache::CollectionCache;
use crate::records::{Entity, Patient, Session};
use crate::remote::{ErrorCallback, RemoteStore, SnapshotCallback, SubscriptionHandle};
use crate::types::{Filter, OwnerId};
use crate::write::WriteFailure;

#[derive(Default)]
struct ManagerState {
    /// `None` until the first bind.
    bound: Option<Option<OwnerId>>,
    generation: u64,
    handles: Vec<SubscriptionHandle>,
}

/// Keeps exactly one correctly scoped subscription per entity type.
pub struct SubscriptionManager {
    remote: Arc<dyn RemoteStore>,
    bus: Arc<ChangeBus>,
    patients: Arc<CollectionCache<Patient>>,
    sessions: Arc<CollectionCache<Session>>,
    state: Mutex<ManagerState>,
}

impl SubscriptionManager {
    pub(crate) fn new(
        remote: Arc<dyn RemoteStore>,
        bus: Arc<ChangeBus>,
        runtime: Handle,
        failures: broadcast::Sender<WriteFailure>,
        restore_on_failed_delete: bool,
    ) -> Self {
        let patients = Arc::new(CollectionCache::new(
            Arc::clone(&bus),
            Arc::clone(&remote),
            runtime.clone(),
            failures.clone(),
            restore_on_failed_delete,
        ));
        let sessions = Arc::new(CollectionCache::new(
            Arc::clone(&bus),
            Arc::clone(&remote),
            runtime,
            failures,
            restore_on_failed_delete,
        ));
        Self {
            remote,
            bus,
            patients,
            sessions,
            state: Mutex::new(ManagerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn patients(&self) -> &Arc<CollectionCache<Patient>> {
        &self.patients
    }

    pub fn sessions(&self) -> &Arc<CollectionCache<Session>> {
        &self.sessions
    }

    /// The identity currently bound, if any.
    pub fn bound(&self) -> Option<OwnerId> {
        self.lock().bound.clone().flatten()
    }

    /// Number of live subscriptions.
    pub fn live_subscriptions(&self) -> usize {
        self.lock().handles.len()
    }

    /// Bind the caches to `identity`.
    ///
    /// A no-op returning `false` when `identity` is already bound. Otherwise
    /// the caches are emptied and rebound before this returns, one change
    /// event is published per collection, and subscriptions for the new
    /// owner are opened.
    pub fn bind_identity(&self, identity: Option<OwnerId>) -> bool {
        let (generation, stale, patients_epoch, sessions_epoch) = {
            let mut state = self.lock();
            if state.bound.as_ref() == Some(&identity) {
                trace!(owner = ?identity, "identity already bound");
                return false;
            }
            let previous = state.bound.replace(identity.clone()).flatten();
            state.generation += 1;
            info!(from = ?previous, to = ?identity, "identity changed");

            let stale = mem::take(&mut state.handles);
            (
                state.generation,
                stale,
                self.patients.rebind(identity.clone()),
                self.sessions.rebind(identity.clone()),
            )
        };

        for handle in stale {
            handle.unsubscribe();
        }
        self.bus.publish(Patient::TOPIC);
        self.bus.publish(Session::TOPIC);

        let Some(owner) = identity else {
            return true;
        };

        let handles: Vec<SubscriptionHandle> = [
            open(self.remote.as_ref(), &self.patients, &owner, patients_epoch),
            open(self.remote.as_ref(), &self.sessions, &owner, sessions_epoch),
        ]
        .into_iter()
        .flatten()
        .collect();

        let mut state = self.lock();
        if state.generation == generation {
            state.handles = handles;
        } else {
            drop(state);
            debug!(owner = %owner, "identity changed while subscribing; closing");
            for handle in handles {
                handle.unsubscribe();
            }
        }
        true
    }

    /// Stop every subscription and unbind.
    pub fn shutdown(&self) {
        self.bind_identity(None);
    }
}

/// Open the owner-filtered subscription feeding `cache` at `epoch`.
fn open<E: Entity>(
    remote: &dyn RemoteStore,
    cache: &Arc<CollectionCache<E>>,
    owner: &OwnerId,
    epoch: u64,
) -> Option<SubscriptionHandle> {
    let on_snapshot: SnapshotCallback = {
        let cache = Arc::downgrade(cache);
        Arc::new(move |docs| {
            if let Some(cache) = cache.upgrade() {
                cache.apply_snapshot(epoch, docs);
            }
        })
    };
    let on_error: ErrorCallback = {
        let cache = Arc::downgrade(cache);
        Arc::new(move |error| {
            if let Some(cache) = cache.upgrade() {
                cache.subscription_error(epoch, error);
            }
        })
    };

    match remote.subscribe(E::COLLECTION, Filter::owned_by(owner), on_snapshot, on_error) {
        Ok(handle) => {
            debug!(collection = %E::COLLECTION, owner = %owner, epoch, "subscription opened");
            Some(handle)
        }
        Err(e) => {
            error!(collection = %E::COLLECTION, owner = %owner, error = %e, "failed to open subscription");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;
    use crate::memory::{MemoryStore, Operation};
    use crate::types::Collection;
    use serde_json::{Value, json};

    fn manager(store: &Arc<MemoryStore>) -> (SubscriptionManager, Arc<ChangeBus>) {
        let bus = Arc::new(ChangeBus::new());
        let (failures, _) = broadcast::channel(16);
        let remote: Arc<dyn RemoteStore> = store.clone();
        let manager =
            SubscriptionManager::new(remote, Arc::clone(&bus), Handle::current(), failures, false);
        (manager, bus)
    }

    fn body(value: Value) -> crate::types::Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_bind_opens_scoped_subscriptions() {
        let store = Arc::new(MemoryStore::new());
        store.seed(Collection::Patients, "p1", body(json!({"ownerId": "u1"})));
        store.seed(Collection::Patients, "p2", body(json!({"ownerId": "u2"})));
        let (manager, _bus) = manager(&store);

        assert!(manager.bind_identity(Some(OwnerId::from("u1"))));

        assert_eq!(manager.bound(), Some(OwnerId::from("u1")));
        assert_eq!(manager.live_subscriptions(), 2);
        assert_eq!(store.listener_count(Collection::Patients), 1);
        assert_eq!(store.listener_count(Collection::Sessions), 1);
        let ids: Vec<_> = manager.patients().list().into_iter().map(|p| p.patient_id).collect();
        assert_eq!(ids, vec!["p1"]);
    }

    #[tokio::test]
    async fn test_rebinding_same_identity_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let (manager, bus) = manager(&store);
        let mut events = bus.receiver();

        assert!(manager.bind_identity(Some(OwnerId::from("u1"))));
        while events.try_recv().is_ok() {}

        assert!(!manager.bind_identity(Some(OwnerId::from("u1"))));
        assert!(events.try_recv().is_err());
        assert_eq!(store.listener_count(Collection::Patients), 1);
    }

    #[tokio::test]
    async fn test_identity_change_stops_old_subscriptions() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _bus) = manager(&store);

        manager.bind_identity(Some(OwnerId::from("u1")));
        manager.bind_identity(Some(OwnerId::from("u2")));
        assert_eq!(store.listener_count(Collection::Patients), 1);

        manager.bind_identity(None);
        assert_eq!(store.listener_count(Collection::Patients), 0);
        assert_eq!(store.listener_count(Collection::Sessions), 0);
        assert_eq!(manager.live_subscriptions(), 0);
        assert_eq!(manager.bound(), None);
    }

    #[tokio::test]
    async fn test_sign_out_publishes_once_per_collection() {
        let store = Arc::new(MemoryStore::new());
        let (manager, bus) = manager(&store);
        manager.bind_identity(Some(OwnerId::from("u1")));
        let mut events = bus.receiver();

        manager.bind_identity(None);

        assert_eq!(events.try_recv().unwrap(), Topic::PatientsChanged);
        assert_eq!(events.try_recv().unwrap(), Topic::SessionsChanged);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_cache_empty() {
        let store = Arc::new(MemoryStore::new());
        store.seed(Collection::Patients, "p1", body(json!({"ownerId": "u1"})));
        store.fail_next(Operation::Subscribe, 1);
        let (manager, _bus) = manager(&store);

        assert!(manager.bind_identity(Some(OwnerId::from("u1"))));

        assert!(manager.patients().is_empty());
        assert_eq!(manager.live_subscriptions(), 1);
        assert_eq!(manager.bound(), Some(OwnerId::from("u1")));
    }

    #[tokio::test]
    async fn test_rebind_from_change_handler() {
        let store = Arc::new(MemoryStore::new());
        let (manager, bus) = manager(&store);
        let manager = Arc::new(manager);

        let weak = Arc::downgrade(&manager);
        bus.subscribe(Topic::PatientsChanged, move |_| {
            if let Some(manager) = weak.upgrade()
                && manager.bound().is_some_and(|owner| owner.as_str() == "u1")
            {
                manager.bind_identity(Some(OwnerId::from("u2")));
            }
        });

        manager.bind_identity(Some(OwnerId::from("u1")));

        assert_eq!(manager.bound(), Some(OwnerId::from("u2")));
        assert_eq!(store.listener_count(Collection::Patients), 1);
        assert_eq!(store.listener_count(Collection::Sessions), 1);
    }
}
