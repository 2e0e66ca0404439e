//! Transcription job manager.
//!
//! Owns the durable queue of per-lesson transcription requests, a bounded
//! worker pool that drives the external speech recognizer, and the table of
//! live recognizer processes used for cancellation. At most one recognizer
//! process is ever running per lesson: a new request for the same lesson
//! cancels the previous one before the fresh job is admitted.

mod error;
mod types;

use std::collections::{HashMap, HashSet};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::EduvidConfig;
use crate::lesson::{LessonStore, TranscriptUpdate};
use crate::queue::{
    QueueResult, TranscriptionQueueStore, TranscriptionRecord, TranscriptionRequest,
    TranscriptionStatus,
};
use crate::subtitle;

pub use error::{TranscriberError, TranscriberResult};
pub use types::{
    JobCompletion, JobHandle, QueueStatusSnapshot, RecognizerOutcome, TranscriptArtifacts,
};

/// Live recognizer process for one lesson. Inserted on spawn, removed on
/// every exit path including caller-initiated cancellation.
#[derive(Debug, Clone, Copy)]
struct ActiveProcess {
    job_id: i64,
    pid: u32,
}

pub struct TranscriptionManager {
    store: TranscriptionQueueStore,
    lessons: Arc<dyn LessonStore>,
    config: Arc<EduvidConfig>,
    /// lesson id -> live OS process, the cancellation surface.
    active: Mutex<HashMap<i64, ActiveProcess>>,
    /// lessons with a claimed job anywhere between claim and terminal
    /// persistence; keeps two workers off the same lesson even before the
    /// process has spawned.
    claims: Mutex<HashSet<i64>>,
    waiters: Mutex<HashMap<i64, oneshot::Sender<TranscriberResult<JobCompletion>>>>,
    wake: Notify,
    grace: Duration,
}

impl std::fmt::Debug for TranscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptionManager")
            .field("store", &self.store)
            .field("grace", &self.grace)
            .finish()
    }
}

impl TranscriptionManager {
    pub fn new(
        store: TranscriptionQueueStore,
        lessons: Arc<dyn LessonStore>,
        config: EduvidConfig,
    ) -> Self {
        let grace = Duration::from_secs(config.worker.cancel_grace_seconds);
        Self {
            store,
            lessons,
            config: Arc::new(config),
            active: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashSet::new()),
            waiters: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            grace,
        }
    }

    pub fn store(&self) -> &TranscriptionQueueStore {
        &self.store
    }

    /// Admit a transcription request. Any live recognizer for the lesson is
    /// cancelled first and still-queued rows are superseded, so the fresh
    /// job is the only one left standing for this lesson.
    pub async fn enqueue(&self, request: TranscriptionRequest) -> TranscriberResult<JobHandle> {
        if !self.config.recognizer.enabled {
            return Err(TranscriberError::Disabled);
        }
        if request.lesson_id <= 0 {
            return Err(TranscriberError::InvalidRequest(
                "lesson_id is required".into(),
            ));
        }
        if request.video_path.trim().is_empty() {
            return Err(TranscriberError::InvalidRequest(
                "video_path is required".into(),
            ));
        }

        if self.cancel(request.lesson_id).await? {
            debug!(
                lesson_id = request.lesson_id,
                "cancelled previous job before re-enqueue"
            );
        }
        let superseded = self.store.supersede_queued(request.lesson_id)?;
        if !superseded.is_empty() {
            debug!(
                lesson_id = request.lesson_id,
                count = superseded.len(),
                "marked stale queued jobs as cancelled"
            );
            // superseded jobs never run, so their waiters resolve here
            let mut waiters = self.waiters.lock().unwrap();
            for job_id in &superseded {
                if let Some(sender) = waiters.remove(job_id) {
                    let _ = sender.send(Err(TranscriberError::Cancelled));
                }
            }
        }

        let job_id = self.store.enqueue(&request)?;
        let (sender, receiver) = oneshot::channel();
        self.waiters.lock().unwrap().insert(job_id, sender);
        self.wake.notify_one();
        info!(
            lesson_id = request.lesson_id,
            job_id, "transcription job enqueued"
        );
        Ok(JobHandle {
            job_id,
            lesson_id: request.lesson_id,
            receiver,
        })
    }

    /// Cancel the live recognizer for a lesson. Returns `false` when none
    /// is tracked. The active entry is removed as soon as termination is
    /// initiated; the worker awaiting the process finishes the bookkeeping
    /// once the exit is observed.
    pub async fn cancel(&self, lesson_id: i64) -> TranscriberResult<bool> {
        let entry = self.active.lock().unwrap().remove(&lesson_id);
        let Some(process) = entry else {
            return Ok(false);
        };
        info!(
            lesson_id,
            job_id = process.job_id,
            pid = process.pid,
            "cancelling active transcription"
        );
        terminate_with_grace(process.pid, self.grace);
        Ok(true)
    }

    pub fn queue_status(&self) -> QueueStatusSnapshot {
        let mut active_lessons: Vec<i64> = self.active.lock().unwrap().keys().copied().collect();
        active_lessons.sort_unstable();
        QueueStatusSnapshot { active_lessons }
    }

    /// Re-queue rows a previous process left in flight. Call once before
    /// spawning workers.
    pub fn recover_interrupted(&self) -> QueueResult<usize> {
        self.store.recover_interrupted()
    }

    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let count = self.config.worker.concurrency.max(1);
        (0..count)
            .map(|worker| {
                let manager = Arc::clone(self);
                tokio::spawn(async move { manager.worker_loop(worker).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize) {
        let poll = Duration::from_secs(self.config.worker.poll_interval_seconds.max(1));
        debug!(worker, "transcription worker started");
        loop {
            match self.claim_next() {
                Ok(Some(record)) => {
                    let lesson_id = record.lesson_id;
                    self.process_job(record).await;
                    self.claims.lock().unwrap().remove(&lesson_id);
                }
                Ok(None) => {
                    let _ = timeout(poll, self.wake.notified()).await;
                }
                Err(error) => {
                    warn!(worker, %error, "queue poll failed");
                    sleep(poll).await;
                }
            }
        }
    }

    /// Claim the next runnable job while holding the claims lock, so two
    /// workers can never pick up jobs for the same lesson.
    fn claim_next(&self) -> QueueResult<Option<TranscriptionRecord>> {
        let mut claims = self.claims.lock().unwrap();
        let excluded: Vec<i64> = claims.iter().copied().collect();
        match self.store.begin_processing(&excluded)? {
            Some(record) => {
                claims.insert(record.lesson_id);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn process_job(&self, job: TranscriptionRecord) {
        let outcome = self.run_recognizer(&job).await;
        if let Err(error) = self.finalize(&job, outcome).await {
            warn!(job_id = job.id, %error, "failed to persist job outcome");
        }
    }

    async fn run_recognizer(&self, job: &TranscriptionRecord) -> RecognizerOutcome {
        let video = self.resolve_video_path(&job.video_path);
        let output_dir = self.job_output_dir(job.id);
        if let Err(source) = fs::create_dir_all(&output_dir).await {
            return RecognizerOutcome::SpawnError {
                message: format!(
                    "failed to create recognizer output dir {}: {source}",
                    output_dir.display()
                ),
            };
        }

        let recognizer = &self.config.recognizer;
        let mut command = Command::new(&recognizer.command);
        command
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .arg(&video)
            .arg("--model")
            .arg(&recognizer.model)
            .arg("--task")
            .arg(&recognizer.task)
            .arg("--output_format")
            .arg(&recognizer.output_format)
            .arg("--output_dir")
            .arg(&output_dir)
            .arg("--fp16")
            .arg(if recognizer.fp16 { "True" } else { "False" });
        if !recognizer.language.is_empty() {
            command.arg("--language").arg(&recognizer.language);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                return RecognizerOutcome::SpawnError {
                    message: format!("{}: {source}", recognizer.command),
                }
            }
        };
        let pid = child.id().unwrap_or_default();
        self.active.lock().unwrap().insert(
            job.lesson_id,
            ActiveProcess {
                job_id: job.id,
                pid,
            },
        );
        info!(
            job_id = job.id,
            lesson_id = job.lesson_id,
            pid,
            video = %video.display(),
            "recognizer started"
        );

        let waited = child.wait_with_output().await;
        {
            // the entry may already be gone (cancel) or belong to a newer job
            let mut active = self.active.lock().unwrap();
            if active.get(&job.lesson_id).map(|process| process.job_id) == Some(job.id) {
                active.remove(&job.lesson_id);
            }
        }

        let output = match waited {
            Ok(output) => output,
            Err(source) => {
                return RecognizerOutcome::Failed {
                    exit_code: -1,
                    message: format!("failed to await recognizer: {source}"),
                }
            }
        };
        if let Some(signal) = output.status.signal() {
            debug!(job_id = job.id, signal, "recognizer terminated by signal");
            return RecognizerOutcome::Cancelled;
        }
        match output.status.code() {
            Some(0) => RecognizerOutcome::Completed {
                artifacts: self.collect_artifacts(job, &output_dir).await,
            },
            Some(code) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr = stderr.trim();
                let mut message = format!("recognizer exited with code {code}");
                if !stderr.is_empty() {
                    message.push_str(": ");
                    message.push_str(stderr);
                }
                RecognizerOutcome::Failed {
                    exit_code: code,
                    message,
                }
            }
            // no exit code and no signal should not happen on unix
            None => RecognizerOutcome::Cancelled,
        }
    }

    /// Locate the caption file the recognizer is expected to have written
    /// and publish it (plus the structured-segment JSON) under the uploads
    /// tree. A missing caption file is a soft success, not an error.
    async fn collect_artifacts(
        &self,
        job: &TranscriptionRecord,
        output_dir: &Path,
    ) -> Option<TranscriptArtifacts> {
        let base = Path::new(&job.video_path)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("lesson-{}", job.lesson_id));
        let produced = output_dir.join(format!("{base}.srt"));
        if !produced.exists() {
            warn!(
                job_id = job.id,
                expected = %produced.display(),
                "recognizer exited cleanly but produced no captions"
            );
            return None;
        }

        let public_dir = self.uploads_transcript_dir(job.course_id);
        let published = public_dir.join(format!("{base}.srt"));
        if let Err(error) = self.publish_file(&produced, &published).await {
            warn!(job_id = job.id, %error, "failed to publish caption artifact");
            return None;
        }
        let transcript_url = format!(
            "/uploads/courses/{}/transcripts/{base}.srt",
            job.course_id
        );

        // segment conversion is independent: a failure here degrades the
        // result to raw captions instead of failing the job
        let json_target = public_dir.join(format!("{base}.json"));
        let transcript_json_url = match self.convert_segments(&produced, &json_target).await {
            Ok(count) => {
                debug!(job_id = job.id, segments = count, "segment json written");
                Some(format!(
                    "/uploads/courses/{}/transcripts/{base}.json",
                    job.course_id
                ))
            }
            Err(error) => {
                warn!(
                    job_id = job.id,
                    %error,
                    "segment conversion failed, keeping raw captions only"
                );
                None
            }
        };

        Some(TranscriptArtifacts {
            transcript_url,
            transcript_json_url,
        })
    }

    async fn publish_file(&self, from: &Path, to: &Path) -> TranscriberResult<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| TranscriberError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        fs::copy(from, to)
            .await
            .map(|_| ())
            .map_err(|source| TranscriberError::Io {
                path: to.to_path_buf(),
                source,
            })
    }

    async fn convert_segments(&self, captions: &Path, target: &Path) -> TranscriberResult<usize> {
        let raw = fs::read_to_string(captions)
            .await
            .map_err(|source| TranscriberError::Io {
                path: captions.to_path_buf(),
                source,
            })?;
        let segments = subtitle::convert(&raw);
        let payload = serde_json::to_vec_pretty(&segments)?;
        fs::write(target, payload)
            .await
            .map_err(|source| TranscriberError::Io {
                path: target.to_path_buf(),
                source,
            })?;
        Ok(segments.len())
    }

    /// Persist the terminal state, mirror it onto the lesson, and resolve
    /// the waiter. The single match here is the only place outcomes are
    /// interpreted.
    async fn finalize(
        &self,
        job: &TranscriptionRecord,
        outcome: RecognizerOutcome,
    ) -> TranscriberResult<()> {
        let (status, error_message, artifacts, waiter_result) = match outcome {
            RecognizerOutcome::Completed { artifacts } => (
                TranscriptionStatus::Completed,
                None,
                artifacts.clone(),
                Ok(JobCompletion {
                    job_id: job.id,
                    lesson_id: job.lesson_id,
                    artifacts,
                }),
            ),
            RecognizerOutcome::Failed { exit_code, message } => (
                TranscriptionStatus::Failed,
                Some(message.clone()),
                None,
                Err(TranscriberError::Recognizer { exit_code, message }),
            ),
            RecognizerOutcome::Cancelled => (
                TranscriptionStatus::Cancelled,
                None,
                None,
                Err(TranscriberError::Cancelled),
            ),
            RecognizerOutcome::SpawnError { message } => (
                TranscriptionStatus::Failed,
                Some(message.clone()),
                None,
                Err(TranscriberError::Spawn {
                    command: self.config.recognizer.command.clone(),
                    message,
                }),
            ),
        };

        match status {
            TranscriptionStatus::Completed => {
                info!(job_id = job.id, lesson_id = job.lesson_id, "transcription completed")
            }
            TranscriptionStatus::Cancelled => {
                info!(job_id = job.id, lesson_id = job.lesson_id, "transcription cancelled")
            }
            _ => warn!(
                job_id = job.id,
                lesson_id = job.lesson_id,
                error = error_message.as_deref().unwrap_or(""),
                "transcription failed"
            ),
        }

        let transcript_url = artifacts.as_ref().map(|a| a.transcript_url.clone());
        let transcript_json_url = artifacts
            .as_ref()
            .and_then(|a| a.transcript_json_url.clone());

        let marked = self.store.mark_result(
            job.id,
            status,
            error_message.as_deref(),
            transcript_url.as_deref(),
            transcript_json_url.as_deref(),
        );
        let lesson_updated = self
            .lessons
            .apply_transcript_update(
                job.lesson_id,
                TranscriptUpdate {
                    status,
                    transcript_url,
                    transcript_json_url,
                },
            )
            .await;

        // the waiter is resolved regardless of persistence trouble
        if let Some(sender) = self.waiters.lock().unwrap().remove(&job.id) {
            let _ = sender.send(waiter_result);
        }

        marked?;
        lesson_updated?;
        Ok(())
    }

    fn resolve_video_path(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        self.config
            .resolve_path(&self.config.paths.media_dir)
            .join(path)
    }

    /// Per-job output directory keeps recognizer runs for identically-named
    /// videos from clobbering each other.
    fn job_output_dir(&self, job_id: i64) -> PathBuf {
        self.config
            .resolve_path(&self.config.recognizer.output_dir)
            .join(format!("job-{job_id}"))
    }

    fn uploads_transcript_dir(&self, course_id: i64) -> PathBuf {
        self.config
            .resolve_path(&self.config.paths.uploads_dir)
            .join("courses")
            .join(course_id.to_string())
            .join("transcripts")
    }
}

/// Two-stage termination: SIGTERM now, SIGKILL after the grace period if
/// the process is still around.
fn terminate_with_grace(pid: u32, grace: Duration) {
    let pid = Pid::from_raw(pid as i32);
    if pid.as_raw() <= 0 {
        return;
    }
    if let Err(error) = signal::kill(pid, Signal::SIGTERM) {
        debug!(pid = pid.as_raw(), %error, "graceful termination signal not delivered");
        return;
    }
    tokio::spawn(async move {
        sleep(grace).await;
        if signal::kill(pid, None).is_ok() {
            warn!(
                pid = pid.as_raw(),
                "recognizer survived the grace period, forcing termination"
            );
            let _ = signal::kill(pid, Signal::SIGKILL);
        }
    });
}
