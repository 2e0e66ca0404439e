use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use eduvid_core::{
    load_eduvid_config, EduvidConfig, HlsBuilder, HlsError, MemoryLessonStore, QueueError,
    QueueFilter, TranscriptionManager, TranscriptionQueueStore, TranscriptionRecord,
    TranscriptionRequest, TranscriptionStatus,
};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] eduvid_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("hls error: {0}")]
    Hls(#[from] HlsError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "eduvid media pipeline control interface", long_about = None)]
pub struct Cli {
    /// Path of the main eduvid.toml
    #[arg(long, default_value = "configs/eduvid.toml")]
    pub config: PathBuf,
    /// Alternative path for the transcription queue database
    #[arg(long)]
    pub queue_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show a summary of the transcription queue
    Status,
    /// Transcription queue operations
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Run the transcription worker pool in the foreground
    #[command(subcommand)]
    Worker(WorkerCommands),
    /// Adaptive-bitrate rendition operations
    #[command(subcommand)]
    Hls(HlsCommands),
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// List queued and finished transcription jobs
    Show(QueueShowArgs),
    /// Enqueue a transcription job for a lesson video
    Enqueue(QueueEnqueueArgs),
}

#[derive(Args, Debug)]
pub struct QueueShowArgs {
    /// Filter by status
    #[arg(long)]
    pub status: Option<String>,
    /// Maximum number of records returned
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct QueueEnqueueArgs {
    #[arg(long)]
    pub lesson_id: i64,
    /// Video path, absolute or relative to paths.media_dir
    #[arg(long)]
    pub video_path: String,
    #[arg(long)]
    pub user_id: i64,
    #[arg(long)]
    pub course_id: i64,
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommands {
    /// Process queued jobs until interrupted
    Run,
}

#[derive(Subcommand, Debug)]
pub enum HlsCommands {
    /// Build the full rendition set for one source video
    Build(HlsBuildArgs),
}

#[derive(Args, Debug)]
pub struct HlsBuildArgs {
    #[arg(long)]
    pub input: PathBuf,
    #[arg(long)]
    pub output_dir: PathBuf,
    /// Master playlist file name inside the output directory
    #[arg(long)]
    pub master_name: Option<String>,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Status => {
            let status = context.gather_status()?;
            render(&status, cli.format)?;
        }
        Commands::Queue(QueueCommands::Show(args)) => {
            let rows = context.queue_show(args)?;
            render(&rows, cli.format)?;
        }
        Commands::Queue(QueueCommands::Enqueue(args)) => {
            let report = context.queue_enqueue(args)?;
            render(&report, cli.format)?;
        }
        Commands::Worker(WorkerCommands::Run) => {
            context.worker_run().await?;
        }
        Commands::Hls(HlsCommands::Build(args)) => {
            let report = context.hls_build(args).await?;
            render(&report, cli.format)?;
        }
    }

    Ok(())
}

pub struct AppContext {
    config: EduvidConfig,
    queue_db: PathBuf,
}

impl AppContext {
    pub fn new(cli: &Cli) -> Result<Self> {
        let config = load_eduvid_config(&cli.config)?;
        let queue_db = cli.queue_db.clone().unwrap_or_else(|| {
            config
                .resolve_path(&config.paths.data_dir)
                .join("transcriptions.sqlite")
        });
        Ok(Self { config, queue_db })
    }

    fn open_store(&self) -> Result<TranscriptionQueueStore> {
        if let Some(parent) = self.queue_db.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = TranscriptionQueueStore::new(&self.queue_db)?;
        store.initialize()?;
        Ok(store)
    }

    pub fn gather_status(&self) -> Result<StatusReport> {
        let store = self.open_store()?;
        let summary = store.summary()?;
        let counts = STATUS_ORDER
            .iter()
            .map(|status| StatusCount {
                status: status.to_string(),
                count: summary.counts.get(status).copied().unwrap_or(0),
            })
            .collect();
        Ok(StatusReport {
            queue_db: self.queue_db.display().to_string(),
            counts,
        })
    }

    pub fn queue_show(&self, args: &QueueShowArgs) -> Result<Vec<TranscriptionRecord>> {
        let store = self.open_store()?;
        let status = match &args.status {
            Some(raw) => Some(raw.parse::<TranscriptionStatus>().map_err(AppError::Queue)?),
            None => None,
        };
        Ok(store.list(&QueueFilter {
            status,
            limit: Some(args.limit),
        })?)
    }

    pub fn queue_enqueue(&self, args: &QueueEnqueueArgs) -> Result<EnqueueReport> {
        if args.video_path.trim().is_empty() {
            return Err(AppError::MissingResource("video_path".into()));
        }
        if args.lesson_id <= 0 {
            return Err(AppError::MissingResource("lesson_id".into()));
        }
        let store = self.open_store()?;
        let superseded = store.supersede_queued(args.lesson_id)?.len();
        let job_id = store.enqueue(&TranscriptionRequest {
            lesson_id: args.lesson_id,
            video_path: args.video_path.clone(),
            user_id: args.user_id,
            course_id: args.course_id,
        })?;
        Ok(EnqueueReport {
            job_id,
            lesson_id: args.lesson_id,
            superseded,
        })
    }

    pub async fn worker_run(&self) -> Result<()> {
        let store = self.open_store()?;
        let manager = Arc::new(TranscriptionManager::new(
            store,
            Arc::new(MemoryLessonStore::new()),
            self.config.clone(),
        ));
        let recovered = manager.recover_interrupted()?;
        if recovered > 0 {
            info!(recovered, "re-queued jobs interrupted by a previous run");
        }
        let _workers = manager.spawn_workers();
        info!(
            concurrency = self.config.worker.concurrency,
            queue_db = %self.queue_db.display(),
            "transcription workers running, press ctrl-c to stop"
        );
        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        Ok(())
    }

    pub async fn hls_build(&self, args: &HlsBuildArgs) -> Result<HlsBuildReport> {
        let builder = HlsBuilder::new(&self.config.hls, None)?;
        let input = self.config.resolve_path(&args.input);
        let output_dir = self.config.resolve_path(&args.output_dir);
        let variants = builder.variants().len();
        let master = builder
            .convert_to_hls(&input, &output_dir, args.master_name.as_deref())
            .await?;
        Ok(HlsBuildReport {
            master_playlist: master.display().to_string(),
            variants,
        })
    }
}

const STATUS_ORDER: [TranscriptionStatus; 5] = [
    TranscriptionStatus::Queued,
    TranscriptionStatus::Processing,
    TranscriptionStatus::Completed,
    TranscriptionStatus::Failed,
    TranscriptionStatus::Cancelled,
];

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub queue_db: String,
    pub counts: Vec<StatusCount>,
}

#[derive(Debug, Serialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct EnqueueReport {
    pub job_id: i64,
    pub lesson_id: i64,
    pub superseded: usize,
}

#[derive(Debug, Serialize)]
pub struct HlsBuildReport {
    pub master_playlist: String,
    pub variants: usize,
}

trait TextRender {
    fn text(&self) -> String;
}

impl TextRender for StatusReport {
    fn text(&self) -> String {
        let mut out = format!("queue database: {}\n", self.queue_db);
        for entry in &self.counts {
            out.push_str(&format!("{:<12} {}\n", entry.status, entry.count));
        }
        out
    }
}

impl TextRender for Vec<TranscriptionRecord> {
    fn text(&self) -> String {
        if self.is_empty() {
            return "no transcription jobs found\n".to_string();
        }
        let mut out = String::new();
        for record in self {
            let created = record
                .created_at
                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            out.push_str(&format!(
                "#{:<5} lesson {:<6} {:<10} {:<19} {}\n",
                record.id,
                record.lesson_id,
                record.status,
                created,
                record.error_message.as_deref().unwrap_or("")
            ));
        }
        out
    }
}

impl TextRender for EnqueueReport {
    fn text(&self) -> String {
        format!(
            "enqueued job {} for lesson {} ({} stale queued jobs superseded)\n",
            self.job_id, self.lesson_id, self.superseded
        )
    }
}

impl TextRender for HlsBuildReport {
    fn text(&self) -> String {
        format!(
            "master playlist {} ({} variants)\n",
            self.master_playlist, self.variants
        )
    }
}

fn render<T: Serialize + TextRender>(value: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", value.text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_config(dir: &std::path::Path) -> PathBuf {
        let base = dir.to_string_lossy();
        let raw = format!(
            r#"
[system]
node_name = "ctl-test"
environment = "test"

[paths]
base_dir = "{base}"
media_dir = "media"
uploads_dir = "uploads"
data_dir = "data"
logs_dir = "logs"

[recognizer]
enabled = true
command = "whisper"
model = "base"
task = "transcribe"
output_format = "srt"
fp16 = false
output_dir = "data/transcripts"

[worker]
concurrency = 1
poll_interval_seconds = 1
cancel_grace_seconds = 2

[hls]
ffmpeg = "ffmpeg"
segment_duration = 6
"#
        );
        let path = dir.join("eduvid.toml");
        std::fs::write(&path, raw).unwrap();
        path
    }

    fn context(dir: &std::path::Path) -> AppContext {
        let cli = Cli {
            config: write_config(dir),
            queue_db: None,
            format: OutputFormat::Text,
            command: Commands::Status,
        };
        AppContext::new(&cli).unwrap()
    }

    #[test]
    fn enqueue_then_show_round_trip() {
        let dir = tempdir().unwrap();
        let context = context(dir.path());
        let report = context
            .queue_enqueue(&QueueEnqueueArgs {
                lesson_id: 12,
                video_path: "lessons/12/raw.mp4".into(),
                user_id: 1,
                course_id: 2,
            })
            .unwrap();
        assert_eq!(report.lesson_id, 12);

        let rows = context
            .queue_show(&QueueShowArgs {
                status: Some("queued".into()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, report.job_id);
    }

    #[test]
    fn enqueue_rejects_blank_video_path() {
        let dir = tempdir().unwrap();
        let context = context(dir.path());
        let error = context
            .queue_enqueue(&QueueEnqueueArgs {
                lesson_id: 12,
                video_path: " ".into(),
                user_id: 1,
                course_id: 2,
            })
            .unwrap_err();
        assert!(matches!(error, AppError::MissingResource(_)));
    }

    #[test]
    fn status_reports_all_states() {
        let dir = tempdir().unwrap();
        let context = context(dir.path());
        let status = context.gather_status().unwrap();
        assert_eq!(status.counts.len(), 5);
        assert!(status.counts.iter().all(|entry| entry.count == 0));
    }

    #[test]
    fn queue_show_rejects_unknown_status() {
        let dir = tempdir().unwrap();
        let context = context(dir.path());
        let error = context
            .queue_show(&QueueShowArgs {
                status: Some("bogus".into()),
                limit: 10,
            })
            .unwrap_err();
        assert!(matches!(error, AppError::Queue(QueueError::InvalidStatus(_))));
    }
}
