use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, Row};
use thiserror::Error;

use crate::sqlite::configure_connection;

const QUEUE_SCHEMA: &str = include_str!("../sql/transcription_queue.sql");

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open queue database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on queue database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("queue path not configured")]
    MissingStore,
    #[error("invalid transcription status: {0}")]
    InvalidStatus(String),
    #[error("transcription job not found: {0}")]
    NotFound(i64),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TranscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptionStatus::Queued => "queued",
            TranscriptionStatus::Processing => "processing",
            TranscriptionStatus::Completed => "completed",
            TranscriptionStatus::Failed => "failed",
            TranscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TranscriptionStatus::Completed
                | TranscriptionStatus::Failed
                | TranscriptionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TranscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TranscriptionStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }
}

/// Admission payload for a new transcription job.
#[derive(Debug, Clone, Default)]
pub struct TranscriptionRequest {
    pub lesson_id: i64,
    pub video_path: String,
    pub user_id: i64,
    pub course_id: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TranscriptionRecord {
    pub id: i64,
    pub lesson_id: i64,
    pub video_path: String,
    pub user_id: i64,
    pub course_id: i64,
    pub status: TranscriptionStatus,
    pub error_message: Option<String>,
    pub transcript_path: Option<String>,
    pub transcript_json_path: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TranscriptionRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            lesson_id: row.get("lesson_id")?,
            video_path: row.get("video_path")?,
            user_id: row.get("user_id")?,
            course_id: row.get("course_id")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(TranscriptionStatus::Queued),
            error_message: row.get("error_message")?,
            transcript_path: row.get("transcript_path")?,
            transcript_json_path: row.get("transcript_json_path")?,
            created_at: parse_timestamp(row.get("created_at")?)?,
            started_at: parse_timestamp(row.get("started_at")?)?,
            completed_at: parse_timestamp(row.get("completed_at")?)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub status: Option<TranscriptionStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueSummary {
    pub counts: HashMap<TranscriptionStatus, i64>,
}

#[derive(Debug, Clone)]
pub struct TranscriptionQueueStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for TranscriptionQueueStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl TranscriptionQueueStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> QueueResult<TranscriptionQueueStore> {
        let path = self.path.ok_or(QueueError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(TranscriptionQueueStore { path, flags })
    }
}

/// Durable queue of per-lesson transcription requests. Each call opens its
/// own connection, so the store can be cloned freely across workers.
#[derive(Debug, Clone)]
pub struct TranscriptionQueueStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl TranscriptionQueueStore {
    pub fn builder() -> TranscriptionQueueStoreBuilder {
        TranscriptionQueueStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> QueueResult<Self> {
        TranscriptionQueueStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> QueueResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            QueueError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| QueueError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> QueueResult<()> {
        let conn = self.open()?;
        conn.execute_batch(QUEUE_SCHEMA)?;
        Ok(())
    }

    pub fn enqueue(&self, request: &TranscriptionRequest) -> QueueResult<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO transcription_queue (
                lesson_id, video_path, user_id, course_id, status
            ) VALUES (?1, ?2, ?3, ?4, 'queued')",
            params![
                request.lesson_id,
                &request.video_path,
                request.user_id,
                request.course_id
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Mark still-queued rows for a lesson as cancelled and return their
    /// ids. A fresh enqueue for the same lesson always creates a new job
    /// instead of reusing one.
    pub fn supersede_queued(&self, lesson_id: i64) -> QueueResult<Vec<i64>> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM transcription_queue WHERE lesson_id=?1 AND status='queued'",
            )?;
            let mut rows = stmt.query([lesson_id])?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next()? {
                ids.push(row.get::<_, i64>(0)?);
            }
            ids
        };
        if !ids.is_empty() {
            tx.execute(
                "UPDATE transcription_queue
                 SET status='cancelled',
                     error_message='superseded by a newer request',
                     completed_at=CURRENT_TIMESTAMP
                 WHERE lesson_id=?1 AND status='queued'",
                [lesson_id],
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Claim the oldest queued job whose lesson is not in `excluded_lessons`
    /// and flip it to processing. The claim happens inside a transaction so
    /// two workers can never take the same row.
    pub fn begin_processing(
        &self,
        excluded_lessons: &[i64],
    ) -> QueueResult<Option<TranscriptionRecord>> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let mut query =
            String::from("SELECT * FROM transcription_queue WHERE status='queued'");
        let mut bindings: Vec<Value> = Vec::new();
        if !excluded_lessons.is_empty() {
            let placeholders = vec!["?"; excluded_lessons.len()].join(", ");
            query.push_str(&format!(" AND lesson_id NOT IN ({placeholders})"));
            bindings.extend(excluded_lessons.iter().map(|id| Value::Integer(*id)));
        }
        query.push_str(" ORDER BY created_at ASC, id ASC LIMIT 1");

        let claimed = {
            let mut stmt = tx.prepare(&query)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(
                bindings.iter().map(|value| value as &dyn rusqlite::ToSql),
            ))?;
            match rows.next()? {
                Some(row) => Some(TranscriptionRecord::from_row(row)?),
                None => None,
            }
        };

        let Some(mut record) = claimed else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE transcription_queue
             SET status='processing', started_at=CURRENT_TIMESTAMP
             WHERE id=?1",
            [record.id],
        )?;
        tx.commit()?;
        record.status = TranscriptionStatus::Processing;
        record.started_at = Some(Utc::now());
        Ok(Some(record))
    }

    pub fn mark_result(
        &self,
        id: i64,
        status: TranscriptionStatus,
        error_message: Option<&str>,
        transcript_path: Option<&str>,
        transcript_json_path: Option<&str>,
    ) -> QueueResult<()> {
        let conn = self.open()?;
        let completed_at = status.is_terminal().then(|| Utc::now().naive_utc());
        let affected = conn.execute(
            "UPDATE transcription_queue
             SET status=?1, error_message=?2, transcript_path=?3,
                 transcript_json_path=?4, completed_at=?5
             WHERE id=?6",
            params![
                status.as_str(),
                error_message,
                transcript_path,
                transcript_json_path,
                completed_at,
                id
            ],
        )?;
        if affected == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    /// Re-queue rows left in processing by a previous run that died before
    /// reaching a terminal state (at-least-once delivery).
    pub fn recover_interrupted(&self) -> QueueResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE transcription_queue
             SET status='queued', started_at=NULL
             WHERE status='processing'",
            [],
        )?;
        Ok(affected)
    }

    pub fn get(&self, id: i64) -> QueueResult<TranscriptionRecord> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM transcription_queue WHERE id=?1")?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(TranscriptionRecord::from_row(row)?),
            None => Err(QueueError::NotFound(id)),
        }
    }

    pub fn list(&self, filter: &QueueFilter) -> QueueResult<Vec<TranscriptionRecord>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM transcription_queue");
        let mut bindings: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            query.push_str(" WHERE status = ?");
            bindings.push(Value::Text(status.as_str().to_string()));
        }
        query.push_str(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            bindings.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            bindings.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(TranscriptionRecord::from_row(row)?);
        }
        Ok(records)
    }

    pub fn summary(&self) -> QueueResult<QueueSummary> {
        let conn = self.open()?;
        let mut counts = HashMap::new();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM transcription_queue GROUP BY status")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let status = status.parse().unwrap_or(TranscriptionStatus::Queued);
            counts.insert(status, count);
        }
        Ok(QueueSummary { counts })
    }
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    Ok(value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc)))
}
