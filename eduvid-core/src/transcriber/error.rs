use std::path::PathBuf;

use thiserror::Error;

use crate::lesson::LessonStoreError;
use crate::queue::QueueError;

#[derive(Debug, Error)]
pub enum TranscriberError {
    #[error("invalid transcription request: {0}")]
    InvalidRequest(String),
    #[error("transcription is disabled by configuration")]
    Disabled,
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("lesson update failed: {0}")]
    Lesson(#[from] LessonStoreError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to spawn recognizer `{command}`: {message}")]
    Spawn { command: String, message: String },
    #[error("recognizer failed: {message}")]
    Recognizer { exit_code: i32, message: String },
    #[error("transcription cancelled")]
    Cancelled,
    #[error("worker dropped the job before completion")]
    WorkerGone,
}

pub type TranscriberResult<T> = Result<T, TranscriberError>;
