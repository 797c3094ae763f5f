use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::ResourceExt;
use serde::Serialize;

use crate::types::{DownloadPhase, DownloadStatus};

/// Annotation a worker-side reporter may set with the current transfer speed.
pub const DOWNLOAD_RATE_ANNOTATION: &str = "download.beebs.dev/download-rate";

pub const PROGRESSING: &str = "Progressing";
pub const SUCCEEDED: &str = "Succeeded";

/// What the reconciler learned about the worker in this pass.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerState {
    /// The worker job was just created.
    Created { job_name: String },
    Running {
        job_name: String,
        download_rate: Option<String>,
    },
    Succeeded {
        job_name: String,
        completed_at: Option<Time>,
    },
    Failed { job_name: String, reason: String },
    /// A job with the worker's name exists but is not owned by this Download.
    Blocked { job_name: String },
    /// The spec can never be turned into a worker job.
    Invalid { reason: String },
}

impl WorkerState {
    pub fn is_finished(&self) -> bool {
        self.phase().map_or(false, DownloadPhase::is_terminal)
    }

    /// Phase this observation drives the Download towards, if any.
    fn phase(&self) -> Option<DownloadPhase> {
        match self {
            WorkerState::Created { .. } | WorkerState::Running { .. } => {
                Some(DownloadPhase::Running)
            }
            WorkerState::Succeeded { .. } => Some(DownloadPhase::Completed),
            WorkerState::Failed { .. } | WorkerState::Invalid { .. } => {
                Some(DownloadPhase::Failed)
            }
            WorkerState::Blocked { .. } => None,
        }
    }
}

/// Reads the execution counters and conditions of a worker job.
///
/// The job is failed once it carries a `Failed=True` condition, or once more
/// pods failed than `backoff_limit` allows, whichever the substrate reports first.
pub fn observe_job(job: &Job, backoff_limit: i32) -> WorkerState {
    let job_name = job.name();
    let status = job.status.clone().unwrap_or_default();
    let active = status.active.unwrap_or(0);
    let succeeded = status.succeeded.unwrap_or(0);
    let failed = status.failed.unwrap_or(0);

    let finished = status
        .conditions
        .unwrap_or_default()
        .into_iter()
        .find(|condition| {
            (condition.type_ == "Complete" || condition.type_ == "Failed")
                && condition.status == "True"
        });

    match finished {
        Some(condition) if condition.type_ == "Complete" => WorkerState::Succeeded {
            job_name,
            completed_at: status.completion_time,
        },
        Some(condition) => WorkerState::Failed {
            job_name,
            reason: condition
                .message
                .filter(|message| !message.is_empty())
                .or(condition.reason)
                .unwrap_or_else(|| "worker job failed".to_string()),
        },
        None if succeeded > 0 && active == 0 => WorkerState::Succeeded {
            job_name,
            completed_at: status.completion_time,
        },
        None if failed > backoff_limit => WorkerState::Failed {
            job_name,
            reason: format!("worker failed {} times, giving up", failed),
        },
        None => WorkerState::Running {
            download_rate: job.annotations().get(DOWNLOAD_RATE_ANNOTATION).cloned(),
            job_name,
        },
    }
}

/// The fields of a status write. `None` leaves a field untouched.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<DownloadPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_rate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl StatusPatch {
    pub fn is_empty(&self) -> bool {
        self == &StatusPatch::default()
    }

    pub fn apply(&self, status: &mut DownloadStatus) {
        if let Some(phase) = self.phase {
            status.phase = phase;
        }
        if let Some(job_name) = &self.job_name {
            status.job_name = Some(job_name.clone());
        }
        if let Some(rate) = &self.download_rate {
            status.download_rate = Some(rate.clone());
        }
        if let Some(time) = &self.completion_time {
            status.completion_time = Some(time.clone());
        }
        if let Some(message) = &self.error_message {
            status.error_message = Some(message.clone());
        }
        if let Some(conditions) = &self.conditions {
            status.conditions = conditions.clone();
        }
    }
}

/// Folds an observation into the recorded status and returns the minimal
/// patch. The patch is empty when nothing would change.
pub fn sync(
    current: Option<&DownloadStatus>,
    observed: &WorkerState,
    now: DateTime<Utc>,
) -> StatusPatch {
    let current = current.cloned().unwrap_or_default();
    let desired = desired_status(&current, observed, now);
    diff(&current, &desired)
}

fn desired_status(
    current: &DownloadStatus,
    observed: &WorkerState,
    now: DateTime<Utc>,
) -> DownloadStatus {
    let mut desired = current.clone();
    if current.phase.is_terminal() {
        return desired;
    }
    if let Some(phase) = observed.phase() {
        if !current.phase.can_transition_to(phase) {
            return desired;
        }
        desired.phase = phase;
    }

    let conditions = &mut desired.conditions;
    match observed {
        WorkerState::Created { job_name } => {
            desired.job_name = Some(job_name.clone());
            running_condition(conditions, job_name, now);
        }
        WorkerState::Running {
            job_name,
            download_rate,
        } => {
            desired.job_name = Some(job_name.clone());
            if download_rate.is_some() {
                desired.download_rate = download_rate.clone();
            }
            running_condition(conditions, job_name, now);
        }
        WorkerState::Succeeded {
            job_name,
            completed_at,
        } => {
            desired.job_name = Some(job_name.clone());
            desired.completion_time = completed_at.clone().or_else(|| Some(Time(now)));
            worker_finished(conditions, now);
            upsert_condition(
                conditions,
                SUCCEEDED,
                true,
                "DownloadComplete",
                "download uploaded",
                now,
            );
        }
        WorkerState::Failed { job_name, reason } => {
            desired.job_name = Some(job_name.clone());
            desired.error_message = Some(reason.clone());
            worker_finished(conditions, now);
            upsert_condition(conditions, SUCCEEDED, false, "WorkerFailed", reason, now);
        }
        WorkerState::Invalid { reason } => {
            desired.error_message = Some(reason.clone());
            upsert_condition(conditions, PROGRESSING, false, "InvalidSpec", reason, now);
            upsert_condition(conditions, SUCCEEDED, false, "InvalidSpec", reason, now);
        }
        WorkerState::Blocked { job_name } => {
            let message = format!("job {} exists and is not owned by this download", job_name);
            upsert_condition(
                conditions,
                PROGRESSING,
                false,
                "JobOwnershipConflict",
                &message,
                now,
            );
        }
    }
    desired
}

fn running_condition(conditions: &mut Vec<Condition>, job_name: &str, now: DateTime<Utc>) {
    let message = format!("worker job {} is running", job_name);
    upsert_condition(conditions, PROGRESSING, true, "WorkerRunning", &message, now);
}

fn worker_finished(conditions: &mut Vec<Condition>, now: DateTime<Utc>) {
    upsert_condition(
        conditions,
        PROGRESSING,
        false,
        "WorkerFinished",
        "worker job finished",
        now,
    );
}

/// Conditions are keyed by type. The transition time only moves when the
/// status flips.
fn upsert_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    let status = if status { "True" } else { "False" }.to_string();
    match conditions.iter_mut().find(|condition| condition.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = Time(now);
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Time(now),
            observed_generation: None,
        }),
    }
}

fn diff(current: &DownloadStatus, desired: &DownloadStatus) -> StatusPatch {
    fn changed<T: Clone + PartialEq>(current: &T, desired: &T) -> Option<T> {
        (current != desired).then(|| desired.clone())
    }

    StatusPatch {
        phase: changed(&current.phase, &desired.phase),
        job_name: changed(&current.job_name, &desired.job_name).flatten(),
        download_rate: changed(&current.download_rate, &desired.download_rate).flatten(),
        completion_time: changed(&current.completion_time, &desired.completion_time).flatten(),
        error_message: changed(&current.error_message, &desired.error_message).flatten(),
        conditions: changed(&current.conditions, &desired.conditions),
    }
}
