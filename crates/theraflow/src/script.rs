//! Replay scripts: a JSON list of identity changes and mutations run against
//! a clinic, printing the cache state where asked.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use theraflow_store::{
    AuthState, Clinic, OwnerId, Patient, PendingWrite, Session, SyncError, Topic,
};

/// How long to wait for the clinic to follow an identity change.
const IDENTITY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read script: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid script: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("clinic did not follow identity change to {0:?}")]
    IdentityTimeout(Option<OwnerId>),
}

/// One step of a replay script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    SignIn { owner: String },
    SignOut,
    SavePatient { patient: Patient },
    AddSession { session: Session },
    DeletePatient { patient_id: String },
    DeleteSession { id: String },
    ClearPatients,
    /// Wait for every outstanding write.
    Settle,
    /// Print the cache state.
    Show,
}

/// Cache state as printed by `show`.
#[derive(Debug, Serialize)]
pub struct CacheView {
    pub owner: Option<OwnerId>,
    pub patients: Vec<Patient>,
    pub sessions: Vec<Session>,
}

impl CacheView {
    fn capture(clinic: &Clinic) -> Self {
        Self {
            owner: clinic.current_identity(),
            patients: clinic.patients(),
            sessions: clinic.sessions(),
        }
    }
}

/// Summary of a replay.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub steps: usize,
    pub failed: usize,
}

pub fn load(path: &Path) -> Result<Vec<Step>, ScriptError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Run `steps` against `clinic`, driving identity through `auth`.
///
/// Failed operations are reported on `out` and counted; they do not stop the
/// replay. Outstanding writes are settled at the end.
pub async fn replay(
    clinic: &Arc<Clinic>,
    auth: &AuthState,
    steps: &[Step],
    out: &mut impl Write,
) -> Result<ReplayReport, ScriptError> {
    let mut report = ReplayReport::default();
    let mut pending: Vec<(usize, PendingWrite)> = Vec::new();

    for (index, step) in steps.iter().enumerate() {
        debug!(step = index, ?step, "replaying");
        report.steps += 1;
        match step {
            Step::SignIn { owner } => {
                let changes = clinic.bus().receiver();
                auth.sign_in(owner.as_str());
                wait_for_identity(clinic, changes, auth.current()).await?;
            }
            Step::SignOut => {
                let changes = clinic.bus().receiver();
                auth.sign_out();
                wait_for_identity(clinic, changes, None).await?;
            }
            Step::SavePatient { patient } => {
                pending.push((index, clinic.save_patient(patient.clone())));
            }
            Step::AddSession { session } => {
                pending.push((index, clinic.add_session(session.clone())));
            }
            Step::DeletePatient { patient_id } => {
                let result = clinic.delete_patient(patient_id).await;
                record(out, &mut report, index, result)?;
            }
            Step::DeleteSession { id } => {
                let result = clinic.delete_session(id).await;
                record(out, &mut report, index, result)?;
            }
            Step::ClearPatients => {
                let result = clinic.clear_patients().await;
                record(out, &mut report, index, result)?;
            }
            Step::Settle => {
                settle(&mut pending, out, &mut report).await?;
            }
            Step::Show => {
                show(clinic, out)?;
            }
        }
    }

    settle(&mut pending, out, &mut report).await?;
    info!(steps = report.steps, failed = report.failed, "replay finished");
    Ok(report)
}

/// Wait until the clinic is bound to `expected`. A changed binding always
/// publishes, so `changes` must be taken before the identity is changed.
async fn wait_for_identity(
    clinic: &Clinic,
    mut changes: broadcast::Receiver<Topic>,
    expected: Option<OwnerId>,
) -> Result<(), ScriptError> {
    let followed = tokio::time::timeout(IDENTITY_TIMEOUT, async {
        while clinic.current_identity() != expected {
            match changes.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return false,
            }
        }
        true
    })
    .await;
    match followed {
        Ok(true) => Ok(()),
        _ => Err(ScriptError::IdentityTimeout(expected)),
    }
}

async fn settle(
    pending: &mut Vec<(usize, PendingWrite)>,
    out: &mut impl Write,
    report: &mut ReplayReport,
) -> Result<(), ScriptError> {
    for (index, write) in pending.drain(..) {
        let result = write.await;
        record(out, report, index, result)?;
    }
    Ok(())
}

fn record(
    out: &mut impl Write,
    report: &mut ReplayReport,
    index: usize,
    result: Result<(), SyncError>,
) -> Result<(), ScriptError> {
    if let Err(e) = result {
        warn!(step = index, error = %e, "step failed");
        report.failed += 1;
        let line = serde_json::json!({ "step": index, "error": e.to_string() });
        writeln!(out, "{}", line)?;
    }
    Ok(())
}

fn show(clinic: &Clinic, out: &mut impl Write) -> Result<(), ScriptError> {
    let view = CacheView::capture(clinic);
    writeln!(out, "{}", serde_json::to_string(&view)?)?;
    Ok(())
}
