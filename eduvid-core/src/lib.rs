pub mod config;
pub mod error;
pub mod hls;
pub mod lesson;
pub mod queue;
pub mod sqlite;
pub mod subtitle;
pub mod transcriber;

pub use config::{
    load_eduvid_config, EduvidConfig, HlsSection, PathsSection, RecognizerSection, SystemSection,
    WorkerSection,
};
pub use error::{ConfigError, Result};
pub use hls::{
    default_variants, CommandExecutor, HlsBuilder, HlsError, HlsResult, HlsVariant,
    SystemCommandExecutor, DEFAULT_MASTER_PLAYLIST_NAME,
};
pub use lesson::{LessonStore, LessonStoreError, MemoryLessonStore, TranscriptUpdate};
pub use queue::{
    QueueError, QueueFilter, QueueResult, QueueSummary, TranscriptionQueueStore,
    TranscriptionQueueStoreBuilder, TranscriptionRecord, TranscriptionRequest,
    TranscriptionStatus,
};
pub use subtitle::{SubtitleError, SubtitleResult, TranscriptSegment};
pub use transcriber::{
    JobCompletion, JobHandle, QueueStatusSnapshot, RecognizerOutcome, TranscriptArtifacts,
    TranscriberError, TranscriberResult, TranscriptionManager,
};
