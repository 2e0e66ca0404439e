//! Adaptive-bitrate rendition builder.
//!
//! One source video goes in, a complete HLS rendition set comes out: one
//! encoder pass per configured variant plus a master playlist referencing
//! them all. Output is all-or-nothing; a failed variant tears down the
//! whole output directory before the error surfaces.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::HlsSection;

pub const DEFAULT_MASTER_PLAYLIST_NAME: &str = "master.m3u8";

/// Keyframe cadence assumed by the segmenter; GOP size is
/// `segment_duration * RENDITION_FRAME_RATE` so segment boundaries always
/// land on keyframes.
const RENDITION_FRAME_RATE: u32 = 25;

#[derive(Debug, Error)]
pub enum HlsError {
    #[error("no hls variants configured")]
    NoVariants,
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("encoder failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

pub type HlsResult<T> = Result<T, HlsError>;

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}

/// One resolution/bitrate rendition. Configured lists are ordered from
/// highest to lowest quality; the master playlist preserves that order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HlsVariant {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bandwidth: u64,
    pub video_bitrate: String,
    pub audio_bitrate: String,
}

pub fn default_variants() -> Vec<HlsVariant> {
    vec![
        HlsVariant {
            name: "high".into(),
            width: 1920,
            height: 1080,
            bandwidth: 5_000_000,
            video_bitrate: "5000k".into(),
            audio_bitrate: "192k".into(),
        },
        HlsVariant {
            name: "medium".into(),
            width: 1280,
            height: 720,
            bandwidth: 2_800_000,
            video_bitrate: "2800k".into(),
            audio_bitrate: "128k".into(),
        },
        HlsVariant {
            name: "low".into(),
            width: 854,
            height: 480,
            bandwidth: 1_400_000,
            video_bitrate: "1400k".into(),
            audio_bitrate: "96k".into(),
        },
    ]
}

pub struct HlsBuilder {
    ffmpeg: PathBuf,
    segment_duration: u32,
    variants: Vec<HlsVariant>,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for HlsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HlsBuilder")
            .field("ffmpeg", &self.ffmpeg)
            .field("segment_duration", &self.segment_duration)
            .field("variants", &self.variants)
            .finish()
    }
}

impl HlsBuilder {
    pub fn new(section: &HlsSection, executor: Option<Arc<dyn CommandExecutor>>) -> HlsResult<Self> {
        if section.variants.is_empty() {
            return Err(HlsError::NoVariants);
        }
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Ok(Self {
            ffmpeg: PathBuf::from(&section.ffmpeg),
            segment_duration: section.segment_duration,
            variants: section.variants.clone(),
            executor,
        })
    }

    pub fn variants(&self) -> &[HlsVariant] {
        &self.variants
    }

    /// Build the full rendition set under `output_dir` and return the path
    /// of the master playlist. On any failure the output directory is
    /// removed (best effort) before the error is returned, so callers never
    /// observe a half-built rendition set.
    pub async fn convert_to_hls(
        &self,
        input: &Path,
        output_dir: &Path,
        master_playlist_name: Option<&str>,
    ) -> HlsResult<PathBuf> {
        let master_name = master_playlist_name.unwrap_or(DEFAULT_MASTER_PLAYLIST_NAME);
        match self.build(input, output_dir, master_name).await {
            Ok(master_path) => Ok(master_path),
            Err(error) => {
                if let Err(cleanup) = fs::remove_dir_all(output_dir).await {
                    debug!(
                        path = %output_dir.display(),
                        error = %cleanup,
                        "cleanup after failed rendition build was incomplete"
                    );
                }
                Err(error)
            }
        }
    }

    async fn build(
        &self,
        input: &Path,
        output_dir: &Path,
        master_name: &str,
    ) -> HlsResult<PathBuf> {
        self.reset_output_dir(output_dir).await?;
        for variant in &self.variants {
            self.encode_variant(input, output_dir, variant).await?;
        }
        let master_path = output_dir.join(master_name);
        fs::write(&master_path, self.build_master_playlist())
            .await
            .map_err(|source| HlsError::Io {
                path: master_path.clone(),
                source,
            })?;
        info!(
            input = %input.display(),
            master = %master_path.display(),
            variants = self.variants.len(),
            "hls rendition set complete"
        );
        Ok(master_path)
    }

    /// Stale segments from a previous attempt must never leak into a new
    /// rendition set, so the output directory is recreated from scratch.
    async fn reset_output_dir(&self, output_dir: &Path) -> HlsResult<()> {
        if output_dir.exists() {
            fs::remove_dir_all(output_dir)
                .await
                .map_err(|source| HlsError::Io {
                    path: output_dir.to_path_buf(),
                    source,
                })?;
        }
        fs::create_dir_all(output_dir)
            .await
            .map_err(|source| HlsError::Io {
                path: output_dir.to_path_buf(),
                source,
            })
    }

    async fn encode_variant(
        &self,
        input: &Path,
        output_dir: &Path,
        variant: &HlsVariant,
    ) -> HlsResult<()> {
        let variant_dir = output_dir.join(&variant.name);
        fs::create_dir_all(&variant_dir)
            .await
            .map_err(|source| HlsError::Io {
                path: variant_dir.clone(),
                source,
            })?;
        let args = self.variant_args(input, variant, &variant_dir);
        debug!(variant = %variant.name, "starting rendition encode");
        let mut command = Command::new(&self.ffmpeg);
        for arg in &args {
            command.arg(arg);
        }
        let output = self
            .executor
            .run(&mut command)
            .await
            .map_err(|source| HlsError::Io {
                path: self.ffmpeg.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(HlsError::CommandFailure {
                command: format!("{} {}", self.ffmpeg.display(), args.join(" ")),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    fn variant_args(&self, input: &Path, variant: &HlsVariant, variant_dir: &Path) -> Vec<String> {
        let gop = (self.segment_duration * RENDITION_FRAME_RATE).to_string();
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-vf".to_string(),
            format!("scale={}:{}", variant.width, variant.height),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "veryfast".to_string(),
            "-profile:v".to_string(),
            "main".to_string(),
            "-b:v".to_string(),
            variant.video_bitrate.clone(),
            "-sc_threshold".to_string(),
            "0".to_string(),
            "-g".to_string(),
            gop.clone(),
            "-keyint_min".to_string(),
            gop,
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            variant.audio_bitrate.clone(),
            "-ar".to_string(),
            "48000".to_string(),
            "-ac".to_string(),
            "2".to_string(),
            "-hls_time".to_string(),
            self.segment_duration.to_string(),
            "-hls_list_size".to_string(),
            "0".to_string(),
            "-hls_segment_filename".to_string(),
            variant_dir
                .join("segment_%03d.ts")
                .to_string_lossy()
                .to_string(),
            "-f".to_string(),
            "hls".to_string(),
            variant_dir.join("index.m3u8").to_string_lossy().to_string(),
        ]
    }

    fn build_master_playlist(&self) -> String {
        let mut playlist = String::new();
        playlist.push_str("#EXTM3U\n");
        playlist.push_str("#EXT-X-VERSION:3\n");
        for variant in &self.variants {
            playlist.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n",
                variant.bandwidth, variant.width, variant.height
            ));
            playlist.push_str(&format!("{}/index.m3u8\n", variant.name));
        }
        playlist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct RecordingExecutor {
        invocations: Mutex<Vec<Vec<String>>>,
        fail_on_call: Option<usize>,
    }

    impl RecordingExecutor {
        fn new(fail_on_call: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                invocations: Mutex::new(Vec::new()),
                fail_on_call,
            })
        }

        fn calls(&self) -> usize {
            self.invocations.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
            let args: Vec<String> = command
                .as_std()
                .get_args()
                .map(|arg| arg.to_string_lossy().to_string())
                .collect();
            let call = {
                let mut invocations = self.invocations.lock().unwrap();
                invocations.push(args.clone());
                invocations.len() - 1
            };
            if self.fail_on_call == Some(call) {
                return Ok(Output {
                    status: ExitStatus::from_raw(256),
                    stdout: Vec::new(),
                    stderr: b"encoder exploded".to_vec(),
                });
            }
            // emulate the encoder leaving a variant playlist behind
            if let Some(playlist) = args.last() {
                std::fs::write(playlist, "#EXTM3U\n")?;
            }
            Ok(Output {
                status: ExitStatus::from_raw(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    fn section() -> HlsSection {
        HlsSection {
            ffmpeg: "ffmpeg".into(),
            segment_duration: 6,
            master_playlist_name: DEFAULT_MASTER_PLAYLIST_NAME.into(),
            variants: default_variants(),
        }
    }

    #[test]
    fn empty_variant_list_is_rejected() {
        let mut section = section();
        section.variants.clear();
        assert!(matches!(
            HlsBuilder::new(&section, None),
            Err(HlsError::NoVariants)
        ));
    }

    #[tokio::test]
    async fn master_playlist_lists_variants_in_configuration_order() {
        let executor = RecordingExecutor::new(None);
        let builder = HlsBuilder::new(&section(), Some(executor.clone())).unwrap();
        let dir = tempdir().unwrap();
        let output_dir = dir.path().join("hls");
        let master = builder
            .convert_to_hls(Path::new("/videos/lesson.mp4"), &output_dir, None)
            .await
            .expect("build succeeds");

        assert_eq!(master, output_dir.join("master.m3u8"));
        let contents = std::fs::read_to_string(&master).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-VERSION:3");
        let stream_lines: Vec<&&str> = lines
            .iter()
            .filter(|line| line.starts_with("#EXT-X-STREAM-INF"))
            .collect();
        assert_eq!(stream_lines.len(), 3);
        assert_eq!(lines[3], "high/index.m3u8");
        assert_eq!(lines[5], "medium/index.m3u8");
        assert_eq!(lines[7], "low/index.m3u8");
        assert!(lines[2].contains("RESOLUTION=1920x1080"));
        assert_eq!(executor.calls(), 3);
    }

    #[tokio::test]
    async fn variant_encode_carries_segmenter_settings() {
        let executor = RecordingExecutor::new(None);
        let builder = HlsBuilder::new(&section(), Some(executor.clone())).unwrap();
        let dir = tempdir().unwrap();
        builder
            .convert_to_hls(Path::new("/videos/lesson.mp4"), &dir.path().join("out"), None)
            .await
            .unwrap();
        let invocations = executor.invocations.lock().unwrap();
        let first = &invocations[0];
        let position = |flag: &str| first.iter().position(|arg| arg == flag);
        assert_eq!(first[position("-hls_time").unwrap() + 1], "6");
        assert_eq!(first[position("-hls_list_size").unwrap() + 1], "0");
        assert_eq!(first[position("-g").unwrap() + 1], "150");
        assert!(first
            .last()
            .unwrap()
            .ends_with("out/high/index.m3u8"));
    }

    #[tokio::test]
    async fn failed_variant_removes_the_whole_output_dir() {
        let executor = RecordingExecutor::new(Some(1));
        let builder = HlsBuilder::new(&section(), Some(executor.clone())).unwrap();
        let dir = tempdir().unwrap();
        let output_dir = dir.path().join("hls");
        let error = builder
            .convert_to_hls(Path::new("/videos/lesson.mp4"), &output_dir, None)
            .await
            .expect_err("second variant fails");

        match error {
            HlsError::CommandFailure { status, stderr, .. } => {
                assert_eq!(status, Some(1));
                assert!(stderr.contains("encoder exploded"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!output_dir.exists());
        // first variant ran, second failed, third never started
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test]
    async fn rebuild_replaces_stale_output() {
        let executor = RecordingExecutor::new(None);
        let builder = HlsBuilder::new(&section(), Some(executor)).unwrap();
        let dir = tempdir().unwrap();
        let output_dir = dir.path().join("hls");
        std::fs::create_dir_all(output_dir.join("stale")).unwrap();
        std::fs::write(output_dir.join("stale/segment_000.ts"), b"old").unwrap();
        builder
            .convert_to_hls(Path::new("/videos/lesson.mp4"), &output_dir, Some("index.m3u8"))
            .await
            .unwrap();
        assert!(!output_dir.join("stale").exists());
        assert!(output_dir.join("index.m3u8").exists());
    }
}
