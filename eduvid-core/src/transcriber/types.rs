use tokio::sync::oneshot;

use super::error::{TranscriberError, TranscriberResult};

/// Published artifact locations for a finished transcription.
///
/// `transcript_json_url` stays `None` when segment conversion fails; the
/// raw captions remain usable on their own.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TranscriptArtifacts {
    pub transcript_url: String,
    pub transcript_json_url: Option<String>,
}

/// Exit disposition of one recognizer run, consumed by a single exhaustive
/// match at the persistence boundary.
#[derive(Debug)]
pub enum RecognizerOutcome {
    /// Clean exit. `artifacts` is `None` on a soft success where the
    /// recognizer produced no caption file.
    Completed { artifacts: Option<TranscriptArtifacts> },
    Failed { exit_code: i32, message: String },
    Cancelled,
    SpawnError { message: String },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobCompletion {
    pub job_id: i64,
    pub lesson_id: i64,
    pub artifacts: Option<TranscriptArtifacts>,
}

/// Handle returned by `enqueue`; `wait` resolves once the job reaches a
/// terminal state.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: i64,
    pub lesson_id: i64,
    pub(super) receiver: oneshot::Receiver<TranscriberResult<JobCompletion>>,
}

impl JobHandle {
    pub async fn wait(self) -> TranscriberResult<JobCompletion> {
        self.receiver
            .await
            .map_err(|_| TranscriberError::WorkerGone)?
    }
}

/// Snapshot of lessons with a live recognizer process. Purely
/// observational.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStatusSnapshot {
    pub active_lessons: Vec<i64>,
}
