use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde::Serialize;

use crate::status::StatusPatch;
use crate::types::Download;

/// Identity of one Download.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DownloadKey {
    pub namespace: String,
    pub name: String,
}

impl DownloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        DownloadKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DownloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The calls the reconciler makes against the cluster.
///
/// Reads return `Ok(None)` for objects that do not exist.
#[async_trait]
pub trait DownloadStore: Send + Sync {
    async fn get_download(&self, key: &DownloadKey) -> Result<Option<Download>, kube::Error>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, kube::Error>;

    /// Creates the job in one request, owner references included.
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, kube::Error>;

    /// Merge-patches the status subresource. The patch carries the
    /// resourceVersion the decision was based on, so a concurrent write
    /// fails with 409 instead of being overwritten.
    async fn patch_status(
        &self,
        download: &Download,
        patch: &StatusPatch,
    ) -> Result<(), kube::Error>;
}

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }
}

#[derive(Serialize, Debug)]
struct StatusPatchBody<'a> {
    metadata: PatchMetadata,
    status: &'a StatusPatch,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PatchMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
}

#[async_trait]
impl DownloadStore for KubeStore {
    async fn get_download(&self, key: &DownloadKey) -> Result<Option<Download>, kube::Error> {
        let api = Api::<Download>::namespaced(self.client.clone(), &key.namespace);
        not_found_as_none(api.get(&key.name).await)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, kube::Error> {
        let api = Api::<Job>::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, kube::Error> {
        let api = Api::<Job>::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), job).await
    }

    async fn patch_status(
        &self,
        download: &Download,
        patch: &StatusPatch,
    ) -> Result<(), kube::Error> {
        let namespace = download.namespace().unwrap_or_default();
        let api = Api::<Download>::namespaced(self.client.clone(), &namespace);
        let body = StatusPatchBody {
            metadata: PatchMetadata {
                resource_version: download.resource_version(),
            },
            status: patch,
        };
        api.patch_status(
            &download.name(),
            &PatchParams::default(),
            &Patch::Merge(&body),
        )
        .await
        .map(|_| ())
    }
}

fn not_found_as_none<T>(res: Result<T, kube::Error>) -> Result<Option<T>, kube::Error> {
    match res {
        Ok(object) => Ok(Some(object)),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
        Err(error) => Err(error),
    }
}

pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: String::new(),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn not_found_is_none() {
        assert!(matches!(not_found_as_none::<()>(Err(api_error(404))), Ok(None)));
        assert!(matches!(not_found_as_none(Ok(1)), Ok(Some(1))));
        assert!(not_found_as_none::<()>(Err(api_error(500))).is_err());
    }

    #[test]
    fn conflicts_are_detected() {
        assert!(is_conflict(&api_error(409)));
        assert!(!is_conflict(&api_error(404)));
    }

    #[test]
    fn patch_body_carries_resource_version() {
        let patch = StatusPatch {
            job_name: Some("clip-worker".to_string()),
            ..StatusPatch::default()
        };
        let body = StatusPatchBody {
            metadata: PatchMetadata {
                resource_version: Some("42".to_string()),
            },
            status: &patch,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "metadata": { "resourceVersion": "42" },
                "status": { "jobName": "clip-worker" }
            })
        );
    }

    #[test]
    fn key_displays_as_namespaced_name() {
        assert_eq!(DownloadKey::new("default", "clip").to_string(), "default/clip");
    }
}
