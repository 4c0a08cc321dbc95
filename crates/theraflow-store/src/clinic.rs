//! The context object consumers hold.
//!
//! A [`Clinic`] is constructed once, inside a Tokio runtime, and passed to
//! whatever needs patient or session data. Reads are synchronous over the
//! caches. Mutations return a [`PendingWrite`] after the caches already
//! reflect them.

use std::sync::Arc;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::ChangeBus;
use crate::config::ClinicConfig;
use crate::error::{CascadeStep, StoreError, SyncError};
use crate::identity::IdentitySource;
use crate::manager::SubscriptionManager;
use crate::records::{Entity, Patient, Session, UserProfile};
use crate::remote::RemoteStore;
use crate::types::{Collection, Filter, OwnerId};
use crate::write::{PendingWrite, WriteFailure};

/// Field on a session naming its patient.
const SESSION_PATIENT_FIELD: &str = "patientId";

/// Identity-scoped patient and session data.
pub struct Clinic {
    manager: SubscriptionManager,
    bus: Arc<ChangeBus>,
    remote: Arc<dyn RemoteStore>,
    runtime: Handle,
    config: ClinicConfig,
    failures: broadcast::Sender<WriteFailure>,
}

impl Clinic {
    /// Create a context on the current Tokio runtime.
    pub fn new(remote: Arc<dyn RemoteStore>, config: ClinicConfig) -> Result<Arc<Self>, SyncError> {
        let runtime = Handle::try_current().map_err(|e| SyncError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(remote, config, runtime))
    }

    /// Create a context that spawns remote work on `runtime`.
    pub fn with_runtime(
        remote: Arc<dyn RemoteStore>,
        config: ClinicConfig,
        runtime: Handle,
    ) -> Arc<Self> {
        let bus = Arc::new(ChangeBus::with_capacity(config.change_channel_capacity));
        let (failures, _) = broadcast::channel(config.failure_channel_capacity.max(1));
        let manager = SubscriptionManager::new(
            Arc::clone(&remote),
            Arc::clone(&bus),
            runtime.clone(),
            failures.clone(),
            config.restore_on_failed_delete,
        );
        Arc::new(Self {
            manager,
            bus,
            remote,
            runtime,
            config,
            failures,
        })
    }

    pub fn config(&self) -> &ClinicConfig {
        &self.config
    }

    /// Change notifications for consumers.
    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    /// Remote writes that failed after being applied locally.
    pub fn write_failures(&self) -> broadcast::Receiver<WriteFailure> {
        self.failures.subscribe()
    }

    pub fn manager(&self) -> &SubscriptionManager {
        &self.manager
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// See [`SubscriptionManager::bind_identity`].
    pub fn bind_identity(&self, identity: Option<OwnerId>) -> bool {
        self.manager.bind_identity(identity)
    }

    pub fn current_identity(&self) -> Option<OwnerId> {
        self.manager.bound()
    }

    /// Bind to the identity `source` reports now, then keep following it.
    ///
    /// The returned task ends when the source closes or the context is
    /// dropped.
    pub fn follow_identity(self: &Arc<Self>, source: &dyn IdentitySource) -> JoinHandle<()> {
        let mut rx = source.watch();
        let initial = rx.borrow_and_update().clone();
        self.bind_identity(initial);

        let clinic = Arc::downgrade(self);
        self.runtime.spawn(async move {
            while rx.changed().await.is_ok() {
                let identity = rx.borrow_and_update().clone();
                let Some(clinic) = clinic.upgrade() else {
                    break;
                };
                clinic.bind_identity(identity);
            }
            debug!("stopped following identity source");
        })
    }

    /// Stop all subscriptions and unbind.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn patients(&self) -> Vec<Patient> {
        self.manager.patients().list()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.manager.sessions().list()
    }

    pub fn sessions_for_patient(&self, patient_id: &str) -> Vec<Session> {
        self.manager
            .sessions()
            .filter_by(|s| s.patient_id == patient_id)
    }

    /// A patient's sessions, newest first. Sessions without a creation time
    /// sort last.
    pub fn recent_sessions_for_patient(&self, patient_id: &str) -> Vec<Session> {
        let mut sessions = self.sessions_for_patient(patient_id);
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    pub fn find_patient_by_id(&self, patient_id: &str) -> Option<Patient> {
        self.manager.patients().find_by_id(patient_id)
    }

    pub fn find_session_by_id(&self, id: &str) -> Option<Session> {
        self.manager.sessions().find_by_id(id)
    }

    pub fn total_sessions_count(&self) -> usize {
        self.manager.sessions().len()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Create or update a patient. An empty `patient_id` gets a fresh one.
    pub fn save_patient(&self, mut patient: Patient) -> PendingWrite {
        if patient.patient_id.is_empty() {
            patient.patient_id = Uuid::new_v4().to_string();
        }
        self.manager.patients().upsert(patient)
    }

    /// Create or update a session. An empty `id` gets a fresh one.
    pub fn add_session(&self, mut session: Session) -> PendingWrite {
        if session.id.is_empty() {
            session.id = Uuid::new_v4().to_string();
        }
        self.manager.sessions().upsert(session)
    }

    /// Delete a session.
    pub fn delete_session(&self, id: &str) -> PendingWrite {
        self.manager.sessions().remove(id)
    }

    /// Delete a patient together with all of their sessions.
    ///
    /// The patient leaves the cache before this returns. The remote patient
    /// document is deleted first, then every session of the patient in one
    /// batch, and finally the sessions leave the cache. A failure stops the
    /// sequence and is reported with the step that failed.
    pub fn delete_patient(&self, patient_id: &str) -> PendingWrite {
        if patient_id.is_empty() {
            return PendingWrite::ready(Err(SyncError::MissingId(Patient::ID_FIELD)));
        }
        let patients = Arc::clone(self.manager.patients());
        let sessions = Arc::clone(self.manager.sessions());
        let (Some(binding), Some(sessions_binding)) = (patients.binding(), sessions.binding())
        else {
            warn!(patient = %patient_id, "delete rejected: signed out");
            return PendingWrite::ready(Err(SyncError::SignedOut));
        };

        let removed = patients.remove_local(patient_id);
        let remote = Arc::clone(&self.remote);
        let restore = self.config.restore_on_failed_delete;
        let patient_id = patient_id.to_string();

        PendingWrite::spawned(self.runtime.spawn(async move {
            let cascade = |step: CascadeStep, source: StoreError| {
                warn!(patient = %patient_id, %step, error = %source, "cascade delete failed");
                SyncError::Cascade {
                    patient_id: patient_id.clone(),
                    step,
                    source,
                }
            };

            if let Err(e) = remote.delete(Collection::Patients, &patient_id).await {
                if restore && let Some(removed) = removed {
                    patients.restore(removed);
                }
                return Err(cascade(CascadeStep::DeletePatient, e));
            }

            let filter = Filter::owned_by(&binding.owner).eq(SESSION_PATIENT_FIELD, patient_id.as_str());
            let ids: Vec<String> = remote
                .query(Collection::Sessions, &filter)
                .await
                .map_err(|e| cascade(CascadeStep::QuerySessions, e))?
                .into_iter()
                .map(|doc| doc.id)
                .collect();

            if !ids.is_empty() {
                remote
                    .batch_delete(Collection::Sessions, &ids)
                    .await
                    .map_err(|e| cascade(CascadeStep::DeleteSessions, e))?;
            }

            let dropped = sessions.remove_where(sessions_binding.epoch, |s| s.patient_id == patient_id);
            info!(
                patient = %patient_id,
                remote_sessions = ids.len(),
                cached_sessions = dropped,
                "patient deleted"
            );
            Ok::<(), SyncError>(())
        }))
    }

    /// Delete every patient of the bound identity in one batch.
    ///
    /// The cache follows with the next snapshot.
    pub fn clear_patients(&self) -> PendingWrite {
        let Some(owner) = self.current_identity() else {
            return PendingWrite::ready(Err(SyncError::SignedOut));
        };
        let remote = Arc::clone(&self.remote);
        PendingWrite::spawned(self.runtime.spawn(async move {
            let ids: Vec<String> = remote
                .query(Collection::Patients, &Filter::owned_by(&owner))
                .await?
                .into_iter()
                .map(|doc| doc.id)
                .collect();
            if !ids.is_empty() {
                remote.batch_delete(Collection::Patients, &ids).await?;
            }
            info!(owner = %owner, count = ids.len(), "patients cleared");
            Ok::<(), SyncError>(())
        }))
    }

    // =========================================================================
    // User profiles
    // =========================================================================

    /// Write the profile document of `uid`.
    pub async fn create_user_profile(
        &self,
        uid: &str,
        mut profile: UserProfile,
    ) -> Result<(), SyncError> {
        if uid.is_empty() {
            return Err(SyncError::MissingId("uid"));
        }
        profile.uid = uid.to_string();
        if profile.created_at.is_none() {
            profile.created_at = Some(Utc::now());
        }
        let document = match serde_json::to_value(&profile).map_err(StoreError::from)? {
            serde_json::Value::Object(map) => map,
            _ => {
                return Err(SyncError::Store(StoreError::Serialization(
                    "profile did not serialize to an object".to_string(),
                )));
            }
        };
        self.remote.put(Collection::Users, uid, document).await?;
        info!(uid = %uid, "user profile created");
        Ok(())
    }

    /// Read the profile document of `uid`.
    pub async fn user_profile(&self, uid: &str) -> Option<UserProfile> {
        if uid.is_empty() {
            return None;
        }
        match self.remote.get(Collection::Users, uid).await {
            Ok(Some(doc)) => {
                let mut data = doc.data;
                data.insert("uid".to_string(), serde_json::Value::String(doc.id));
                match serde_json::from_value(serde_json::Value::Object(data)) {
                    Ok(profile) => Some(profile),
                    Err(e) => {
                        warn!(uid = %uid, error = %e, "undecodable user profile");
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!(uid = %uid, error = %e, "failed to read user profile");
                None
            }
        }
    }
}
