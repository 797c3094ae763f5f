use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::runtime::controller::{Context, ReconcilerAction};
use kube::{Resource, ResourceExt};
use thiserror::Error;
use tracing::{Instrument, Span};

use crate::job::{construct_job_for_download, worker_job_name, WorkerSettings};
use crate::status::{self, observe_job, WorkerState};
use crate::store::{is_conflict, DownloadKey, DownloadStore};
use crate::types::Download;

const ERROR_REQUEUE_BASE: Duration = Duration::from_secs(3);
const ERROR_REQUEUE_MAX: Duration = Duration::from_secs(300);

pub struct Data {
    pub store: Arc<dyn DownloadStore>,
    pub settings: Settings,
    pub backoff: Backoff,
}

impl Data {
    pub fn new(store: Arc<dyn DownloadStore>, settings: Settings) -> Self {
        Data {
            store,
            settings,
            backoff: Backoff::new(ERROR_REQUEUE_BASE, ERROR_REQUEUE_MAX),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub worker: WorkerSettings,
    /// How often a running worker is checked.
    pub poll_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            worker: WorkerSettings::default(),
            poll_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("Failed to get download: {0}")]
    GetDownloadFailed(#[source] kube::Error),
    #[error("Failed to get worker job: {0}")]
    GetJobFailed(#[source] kube::Error),
    #[error("Failed to create worker job: {0}")]
    CreateJobFailed(#[source] kube::Error),
    #[error("Failed to patch status: {0}")]
    PatchStatusFailed(#[source] kube::Error),
    #[error("Job {0} exists but is not controlled by this download")]
    JobOwnershipConflict(String),
    #[error("attempt {attempt}, retrying in {after:?}: {source}")]
    Retry {
        attempt: u32,
        after: Duration,
        #[source]
        source: Box<Error>,
    },
}

/// Per-download exponential backoff for failed reconciles.
pub struct Backoff {
    failures: Mutex<HashMap<DownloadKey, u32>>,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            failures: Mutex::new(HashMap::new()),
            base,
            max,
        }
    }

    /// Counts a failure and returns the attempt number and the delay before the next try.
    pub fn record_failure(&self, key: &DownloadKey) -> (u32, Duration) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let attempt = failures.entry(key.clone()).or_insert(0);
        *attempt = attempt.saturating_add(1);
        let factor = 1u32.checked_shl(*attempt - 1).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max).min(self.max);
        (*attempt, delay)
    }

    pub fn reset(&self, key: &DownloadKey) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

pub async fn reconcile(
    download: Arc<Download>,
    ctx: Context<Data>,
) -> Result<ReconcilerAction, Error> {
    let data = ctx.into_inner();
    let key = DownloadKey::new(
        download
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?,
        download.name(),
    );
    let log = tracing::info_span!("reconcile", download = %key);

    match reconcile_download(&*data.store, &data.settings, &key, Utc::now(), log).await {
        Ok(action) => {
            data.backoff.reset(&key);
            Ok(action)
        }
        Err(source) => {
            let (attempt, after) = data.backoff.record_failure(&key);
            Err(Error::Retry {
                attempt,
                after,
                source: Box::new(source),
            })
        }
    }
}

pub fn error_policy(error: &Error, _ctx: Context<Data>) -> ReconcilerAction {
    tracing::error!(%error);
    let requeue_after = match error {
        Error::Retry { after, .. } => *after,
        _ => ERROR_REQUEUE_BASE,
    };
    ReconcilerAction {
        requeue_after: Some(requeue_after),
    }
}

/// One pass of the control loop for the Download identified by `key`.
///
/// Always re-reads the Download and its worker job, so any number of calls
/// converge on the same result. Calls for the same key must not overlap.
pub async fn reconcile_download<S: DownloadStore + ?Sized>(
    store: &S,
    settings: &Settings,
    key: &DownloadKey,
    now: DateTime<Utc>,
    log: Span,
) -> Result<ReconcilerAction, Error> {
    reconcile_existing(store, settings, key, now)
        .instrument(log)
        .await
}

async fn reconcile_existing<S: DownloadStore + ?Sized>(
    store: &S,
    settings: &Settings,
    key: &DownloadKey,
    now: DateTime<Utc>,
) -> Result<ReconcilerAction, Error> {
    let download = match store
        .get_download(key)
        .await
        .map_err(Error::GetDownloadFailed)?
    {
        Some(download) => download,
        None => {
            tracing::debug!("download is gone, nothing to do");
            return Ok(done());
        }
    };

    let phase = download
        .status
        .as_ref()
        .map(|status| status.phase)
        .unwrap_or_default();
    if phase.is_terminal() {
        tracing::debug!(?phase, "download already finished");
        return Ok(done());
    }

    // The garbage collector removes the worker during foreground deletion.
    if download.metadata.deletion_timestamp.is_some() {
        tracing::debug!(?phase, "download is being deleted, leaving the worker to the cascade");
        return Ok(done());
    }

    let job_name = worker_job_name(&key.name);
    let job = store
        .get_job(&key.namespace, &job_name)
        .await
        .map_err(Error::GetJobFailed)?;

    let observed = match job {
        Some(job) if !is_controlled_by(&job, &download) => {
            tracing::warn!(
                job = %job_name,
                "worker job exists but is not controlled by this download"
            );
            let blocked = WorkerState::Blocked {
                job_name: job_name.clone(),
            };
            update_status(store, &download, &blocked, now).await?;
            return Err(Error::JobOwnershipConflict(job_name));
        }
        Some(job) => observe_job(&job, settings.worker.backoff_limit),
        None => match construct_job_for_download(&key.name, &download.spec, &settings.worker) {
            Err(invalid) => {
                tracing::warn!(error = %invalid, "download cannot be turned into a worker job");
                WorkerState::Invalid {
                    reason: invalid.to_string(),
                }
            }
            Ok(mut job) => {
                job.metadata.namespace = Some(key.namespace.clone());
                job.metadata.owner_references = Some(vec![OwnerReference {
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                    ..object_to_owner_reference::<Download>(download.metadata.clone())?
                }]);
                match store.create_job(&key.namespace, &job).await {
                    Ok(_) => {
                        tracing::info!(job = %job_name, "created worker job");
                        WorkerState::Created { job_name }
                    }
                    Err(error) if is_conflict(&error) => {
                        tracing::info!(
                            job = %job_name,
                            "worker job appeared concurrently, rechecking"
                        );
                        return Ok(requeue(Duration::ZERO));
                    }
                    Err(error) => return Err(Error::CreateJobFailed(error)),
                }
            }
        },
    };

    update_status(store, &download, &observed, now).await?;

    Ok(match observed {
        observed if observed.is_finished() => done(),
        WorkerState::Created { .. } => requeue(Duration::ZERO),
        _ => requeue(settings.poll_interval),
    })
}

async fn update_status<S: DownloadStore + ?Sized>(
    store: &S,
    download: &Download,
    observed: &WorkerState,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let patch = status::sync(download.status.as_ref(), observed, now);
    if patch.is_empty() {
        tracing::debug!("status up to date");
        return Ok(());
    }
    store
        .patch_status(download, &patch)
        .await
        .map_err(Error::PatchStatusFailed)?;
    tracing::info!(phase = ?patch.phase, "updated status");
    Ok(())
}

fn done() -> ReconcilerAction {
    ReconcilerAction {
        requeue_after: None,
    }
}

fn requeue(after: Duration) -> ReconcilerAction {
    ReconcilerAction {
        requeue_after: Some(after),
    }
}

fn is_controlled_by(job: &Job, download: &Download) -> bool {
    let uid = match download.uid() {
        Some(uid) => uid,
        None => return false,
    };
    job.metadata
        .owner_references
        .as_ref()
        .map_or(false, |owner_references| {
            owner_references.iter().any(|owner_reference| {
                owner_reference.uid == uid && owner_reference.controller == Some(true)
            })
        })
}

fn object_to_owner_reference<K: Resource<DynamicType = ()>>(
    meta: ObjectMeta,
) -> Result<OwnerReference, Error> {
    Ok(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: meta.name.ok_or(Error::MissingObjectKey(".metadata.name"))?,
        uid: meta.uid.ok_or(Error::MissingObjectKey(".metadata.uid"))?,
        ..OwnerReference::default()
    })
}
