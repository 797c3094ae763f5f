use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DownloadSpec defines the desired state of Download
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, PartialEq)]
#[kube(
    group = "download.beebs.dev",
    version = "v1",
    kind = "Download",
    shortname = "dl",
    namespaced
)]
#[kube(status = "DownloadStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Job","type":"string","jsonPath":".status.jobName"}"#)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSpec {
    /// The source URL for yt-dlp to download (e.g. a YouTube or Vimeo link).
    #[serde(rename = "inputURL")]
    pub input_url: String,

    /// Video/audio quality and codec selection, passed verbatim to yt-dlp's `--format`.
    /// Example: `bestvideo[height<=1080]+bestaudio/best[height<=1080]`
    #[serde(default)]
    pub format_selection: Option<String>,

    /// Options for post-download operations like conversion.
    #[serde(default)]
    pub post_processing: Option<PostProcessing>,

    /// Where the final file should be stored.
    pub output: OutputTarget,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostProcessing {
    /// Convert the file to audio-only, yt-dlp `--extract-audio`.
    #[serde(default)]
    pub extract_audio: bool,

    /// Output format for audio extraction (e.g. "mp3", "flac").
    /// Only used together with `extractAudio`.
    #[serde(default)]
    pub audio_format: Option<String>,
}

/// Destination of the downloaded file. Exactly one variant is set.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum OutputTarget {
    S3(S3Output),
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Output {
    /// Name of the S3 bucket.
    pub bucket: String,

    /// Full path/filename within the bucket (e.g. "videos/myvideo.mp4").
    pub key: String,

    /// Name of a Secret holding `accessKeyID` and `secretAccessKey`.
    pub secret_ref: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadPhase {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Default for DownloadPhase {
    fn default() -> Self {
        DownloadPhase::Pending
    }
}

impl DownloadPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadPhase::Completed | DownloadPhase::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            DownloadPhase::Pending => 0,
            DownloadPhase::Running => 1,
            DownloadPhase::Completed | DownloadPhase::Failed => 2,
        }
    }

    /// Phases only move forward: Pending -> Running -> Completed | Failed.
    pub fn can_transition_to(self, next: DownloadPhase) -> bool {
        self == next || (!self.is_terminal() && next.rank() >= self.rank())
    }
}

/// DownloadStatus defines the observed state of Download
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStatus {
    /// Lifecycle of the download.
    #[serde(default)]
    pub phase: DownloadPhase,

    /// Name of the worker Job running the download.
    #[serde(default)]
    pub job_name: Option<String>,

    /// Last known download speed (e.g. "10.3 MiB/s").
    #[serde(default)]
    pub download_rate: Option<String>,

    /// When the download finished.
    #[serde(default)]
    pub completion_time: Option<Time>,

    /// Set when the phase is `Failed`.
    #[serde(default)]
    pub error_message: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_keeps_nested_s3_shape() {
        let spec: DownloadSpec = serde_json::from_value(serde_json::json!({
            "inputURL": "https://example.com/video",
            "output": {
                "s3": { "bucket": "test-bucket", "key": "video.mp4", "secretRef": "s3-creds" }
            }
        }))
        .unwrap();

        assert_eq!(spec.input_url, "https://example.com/video");
        assert_eq!(spec.format_selection, None);
        assert_eq!(
            spec.output,
            OutputTarget::S3(S3Output {
                bucket: "test-bucket".into(),
                key: "video.mp4".into(),
                secret_ref: "s3-creds".into(),
            })
        );
    }

    #[test]
    fn missing_output_is_rejected() {
        let res = serde_json::from_value::<DownloadSpec>(serde_json::json!({
            "inputURL": "https://example.com/video"
        }));
        assert!(res.is_err());
    }

    #[test]
    fn phases_never_move_backwards() {
        use DownloadPhase::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(Completed.can_transition_to(Completed));
    }

    #[test]
    fn empty_status_is_pending() {
        let status: DownloadStatus = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(status.phase, DownloadPhase::Pending);
        assert!(status.conditions.is_empty());
    }
}
