use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec,
    SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

use crate::types::{DownloadSpec, OutputTarget};

const EXECUTABLE: &str = "yt-dlp";
const OUTPUT_TEMPLATE: &str = "/data/%(title)s.%(ext)s";
const DATA_DIR: &str = "/data";
const DATA_VOLUME: &str = "data";
const CONTAINER_NAME: &str = "yt-dlp-worker";
/// Long enough for an in-flight upload to flush before the pod is killed.
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 60;
/// Object names that end up in the `job-name` pod label are capped at 63 characters.
const MAX_JOB_NAME_LEN: usize = 63;

pub const ACCESS_KEY_ENV: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";
pub const ACCESS_KEY_SECRET_KEY: &str = "accessKeyID";
pub const SECRET_KEY_SECRET_KEY: &str = "secretAccessKey";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const DOWNLOAD_LABEL: &str = "download.beebs.dev/download";
pub const S3_KEY_ANNOTATION: &str = "download.beebs.dev/s3-key";

/// Knobs of the worker pod that are not part of a Download.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerSettings {
    pub image: String,
    /// Pod restarts the Job tolerates before it is marked failed.
    pub backoff_limit: i32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            image: "yt-dlp/yt-dlp:latest".to_string(),
            backoff_limit: 3,
        }
    }
}

/// A Download whose spec can never be turned into a runnable worker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidSpec {
    #[error("inputURL must not be empty")]
    EmptyInputUrl,
    #[error("inputURL {0:?} would be parsed as a command line flag")]
    InputUrlIsFlag(String),
    #[error("output.s3.bucket must not be empty")]
    EmptyBucket,
    #[error("output.s3.secretRef must not be empty")]
    EmptySecretRef,
    #[error("worker job name {0:?} exceeds 63 characters")]
    JobNameTooLong(String),
}

/// The worker job of a Download is always `<name>-worker`.
pub fn worker_job_name(download_name: &str) -> String {
    format!("{}-worker", download_name)
}

/// Command line of the worker. The input URL is always the last argument.
pub fn worker_args(spec: &DownloadSpec) -> Vec<String> {
    let mut args: Vec<String> = [EXECUTABLE, "--no-mtime", "--ignore-errors", "-o", OUTPUT_TEMPLATE]
        .iter()
        .map(|arg| arg.to_string())
        .collect();

    if let Some(format) = non_empty(&spec.format_selection) {
        args.extend(["--format".to_string(), format.to_string()]);
    }

    if let Some(post_processing) = &spec.post_processing {
        if post_processing.extract_audio {
            args.push("--extract-audio".to_string());
            if let Some(audio_format) = non_empty(&post_processing.audio_format) {
                args.extend(["--audio-format".to_string(), audio_format.to_string()]);
            }
        }
    }

    match &spec.output {
        OutputTarget::S3(s3) => args.extend([
            "--upload-to".to_string(),
            "s3-generic".to_string(),
            "--s3-bucket".to_string(),
            s3.bucket.clone(),
        ]),
    }

    args.push(spec.input_url.clone());
    args
}

/// Credential references for the output target. Secret values are never read here.
pub fn worker_env(output: &OutputTarget) -> Vec<EnvVar> {
    match output {
        OutputTarget::S3(s3) => vec![
            secret_env(ACCESS_KEY_ENV, &s3.secret_ref, ACCESS_KEY_SECRET_KEY),
            secret_env(SECRET_KEY_ENV, &s3.secret_ref, SECRET_KEY_SECRET_KEY),
        ],
    }
}

pub fn validate(download_name: &str, spec: &DownloadSpec) -> Result<(), InvalidSpec> {
    let url = spec.input_url.trim();
    if url.is_empty() {
        return Err(InvalidSpec::EmptyInputUrl);
    }
    if url.starts_with('-') {
        return Err(InvalidSpec::InputUrlIsFlag(spec.input_url.clone()));
    }
    match &spec.output {
        OutputTarget::S3(s3) => {
            if s3.bucket.trim().is_empty() {
                return Err(InvalidSpec::EmptyBucket);
            }
            if s3.secret_ref.trim().is_empty() {
                return Err(InvalidSpec::EmptySecretRef);
            }
        }
    }
    let job_name = worker_job_name(download_name);
    if job_name.len() > MAX_JOB_NAME_LEN {
        return Err(InvalidSpec::JobNameTooLong(job_name));
    }
    Ok(())
}

/// Builds the worker Job for a Download. Pure: no ownership, no API calls.
pub fn construct_job_for_download(
    download_name: &str,
    spec: &DownloadSpec,
    settings: &WorkerSettings,
) -> Result<Job, InvalidSpec> {
    validate(download_name, spec)?;

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), "ytdlp-operator".to_string());
    labels.insert(DOWNLOAD_LABEL.to_string(), download_name.to_string());

    let mut annotations = BTreeMap::new();
    match &spec.output {
        OutputTarget::S3(s3) => {
            annotations.insert(S3_KEY_ANNOTATION.to_string(), s3.key.clone());
        }
    }

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(worker_job_name(download_name)),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(settings.backoff_limit),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("OnFailure".to_string()),
                    termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(settings.image.clone()),
                        args: Some(worker_args(spec)),
                        env: Some(worker_env(&spec.output)),
                        volume_mounts: Some(vec![VolumeMount {
                            name: DATA_VOLUME.to_string(),
                            mount_path: DATA_DIR.to_string(),
                            ..VolumeMount::default()
                        }]),
                        ..Container::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: DATA_VOLUME.to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Volume::default()
                    }]),
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        status: None,
    })
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: None,
            }),
            ..EnvVarSource::default()
        }),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PostProcessing, S3Output};

    fn basic_spec() -> DownloadSpec {
        DownloadSpec {
            input_url: "https://example.com/video".to_string(),
            format_selection: None,
            post_processing: None,
            output: OutputTarget::S3(S3Output {
                bucket: "test-bucket".to_string(),
                key: "video.mp4".to_string(),
                secret_ref: "s3-creds".to_string(),
            }),
        }
    }

    #[test]
    fn basic_s3_download_args() {
        assert_eq!(
            worker_args(&basic_spec()),
            vec![
                "yt-dlp",
                "--no-mtime",
                "--ignore-errors",
                "-o",
                "/data/%(title)s.%(ext)s",
                "--upload-to",
                "s3-generic",
                "--s3-bucket",
                "test-bucket",
                "https://example.com/video",
            ]
        );
    }

    #[test]
    fn audio_extraction_goes_before_upload_and_url() {
        let spec = DownloadSpec {
            post_processing: Some(PostProcessing {
                extract_audio: true,
                audio_format: Some("mp3".to_string()),
            }),
            ..basic_spec()
        };
        let args = worker_args(&spec);
        let tail: Vec<&str> = args[5..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "--extract-audio",
                "--audio-format",
                "mp3",
                "--upload-to",
                "s3-generic",
                "--s3-bucket",
                "test-bucket",
                "https://example.com/video",
            ]
        );
    }

    #[test]
    fn audio_format_requires_extract_audio() {
        let spec = DownloadSpec {
            post_processing: Some(PostProcessing {
                extract_audio: false,
                audio_format: Some("flac".to_string()),
            }),
            ..basic_spec()
        };
        let args = worker_args(&spec);
        assert!(!args.contains(&"--extract-audio".to_string()));
        assert!(!args.contains(&"--audio-format".to_string()));
    }

    #[test]
    fn format_selection_is_forwarded_verbatim() {
        let spec = DownloadSpec {
            format_selection: Some("bestvideo[height<=1080]+bestaudio/best".to_string()),
            ..basic_spec()
        };
        let args = worker_args(&spec);
        assert_eq!(args[5], "--format");
        assert_eq!(args[6], "bestvideo[height<=1080]+bestaudio/best");
        assert_eq!(args.last().unwrap(), "https://example.com/video");

        let empty = DownloadSpec {
            format_selection: Some(String::new()),
            ..basic_spec()
        };
        assert!(!worker_args(&empty).contains(&"--format".to_string()));
    }

    #[test]
    fn args_are_deterministic() {
        let spec = DownloadSpec {
            format_selection: Some("best".to_string()),
            post_processing: Some(PostProcessing {
                extract_audio: true,
                audio_format: None,
            }),
            ..basic_spec()
        };
        assert_eq!(worker_args(&spec), worker_args(&spec.clone()));
        assert_eq!(worker_args(&spec).last().unwrap(), &spec.input_url);
    }

    #[test]
    fn credentials_are_secret_references() {
        let env = worker_env(&basic_spec().output);
        assert_eq!(env.len(), 2);
        let refs: Vec<(&str, &str, &str)> = env
            .iter()
            .map(|var| {
                assert!(var.value.is_none());
                let selector = var
                    .value_from
                    .as_ref()
                    .and_then(|from| from.secret_key_ref.as_ref())
                    .unwrap();
                (
                    var.name.as_str(),
                    selector.name.as_deref().unwrap(),
                    selector.key.as_str(),
                )
            })
            .collect();
        assert_eq!(
            refs,
            vec![
                ("AWS_ACCESS_KEY_ID", "s3-creds", "accessKeyID"),
                ("AWS_SECRET_ACCESS_KEY", "s3-creds", "secretAccessKey"),
            ]
        );
    }

    #[test]
    fn job_has_restart_on_failure_and_grace_period() {
        let settings = WorkerSettings::default();
        let job = construct_job_for_download("my-video", &basic_spec(), &settings).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("my-video-worker"));
        assert_eq!(
            job.metadata.annotations.unwrap().get(S3_KEY_ANNOTATION),
            Some(&"video.mp4".to_string())
        );
        let job_spec = job.spec.unwrap();
        assert_eq!(job_spec.backoff_limit, Some(3));
        let pod = job_spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));
        assert_eq!(pod.termination_grace_period_seconds, Some(60));
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].image.as_deref(), Some("yt-dlp/yt-dlp:latest"));
        assert_eq!(pod.containers[0].args, Some(worker_args(&basic_spec())));
    }

    #[test]
    fn invalid_specs_are_rejected() {
        let settings = WorkerSettings::default();
        let empty_url = DownloadSpec {
            input_url: "  ".to_string(),
            ..basic_spec()
        };
        assert_eq!(
            construct_job_for_download("a", &empty_url, &settings).unwrap_err(),
            InvalidSpec::EmptyInputUrl
        );

        let flag_url = DownloadSpec {
            input_url: "--exec=rm".to_string(),
            ..basic_spec()
        };
        assert!(matches!(
            validate("a", &flag_url),
            Err(InvalidSpec::InputUrlIsFlag(_))
        ));

        let no_secret = DownloadSpec {
            output: OutputTarget::S3(S3Output {
                bucket: "b".to_string(),
                key: "k".to_string(),
                secret_ref: String::new(),
            }),
            ..basic_spec()
        };
        assert_eq!(validate("a", &no_secret), Err(InvalidSpec::EmptySecretRef));

        let long_name = "x".repeat(60);
        assert!(matches!(
            validate(&long_name, &basic_spec()),
            Err(InvalidSpec::JobNameTooLong(_))
        ));
    }
}
