//! Lesson entity collaborator.
//!
//! Lesson records live in the platform's relational store, outside this
//! crate. The pipeline only ever writes the transcript fields, so the seam
//! is a single-update trait the platform implements against its own
//! persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::queue::TranscriptionStatus;

#[derive(Debug, Error)]
pub enum LessonStoreError {
    #[error("lesson {0} not found")]
    NotFound(i64),
    #[error("lesson store unavailable: {0}")]
    Unavailable(String),
}

/// Transcript fields written back onto a lesson at a terminal job
/// transition. `None` URLs clear nothing; they just stay unset.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TranscriptUpdate {
    pub status: TranscriptionStatus,
    pub transcript_url: Option<String>,
    pub transcript_json_url: Option<String>,
}

#[async_trait]
pub trait LessonStore: Send + Sync {
    async fn apply_transcript_update(
        &self,
        lesson_id: i64,
        update: TranscriptUpdate,
    ) -> Result<(), LessonStoreError>;
}

/// In-memory stand-in used by tests and by `eduvidctl` when no platform
/// store is wired in.
#[derive(Debug, Default)]
pub struct MemoryLessonStore {
    records: Mutex<HashMap<i64, TranscriptUpdate>>,
}

impl MemoryLessonStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcript(&self, lesson_id: i64) -> Option<TranscriptUpdate> {
        self.records.lock().unwrap().get(&lesson_id).cloned()
    }
}

#[async_trait]
impl LessonStore for MemoryLessonStore {
    async fn apply_transcript_update(
        &self,
        lesson_id: i64,
        update: TranscriptUpdate,
    ) -> Result<(), LessonStoreError> {
        self.records.lock().unwrap().insert(lesson_id, update);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_keeps_latest_update() {
        let store = MemoryLessonStore::new();
        store
            .apply_transcript_update(
                10,
                TranscriptUpdate {
                    status: TranscriptionStatus::Processing,
                    transcript_url: None,
                    transcript_json_url: None,
                },
            )
            .await
            .unwrap();
        store
            .apply_transcript_update(
                10,
                TranscriptUpdate {
                    status: TranscriptionStatus::Completed,
                    transcript_url: Some("/uploads/courses/1/transcripts/raw.srt".into()),
                    transcript_json_url: None,
                },
            )
            .await
            .unwrap();
        let update = store.transcript(10).expect("record exists");
        assert_eq!(update.status, TranscriptionStatus::Completed);
        assert!(update.transcript_url.is_some());
        assert!(store.transcript(11).is_none());
    }
}
