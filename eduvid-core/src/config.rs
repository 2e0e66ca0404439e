use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::hls::{default_variants, HlsVariant};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EduvidConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub recognizer: RecognizerSection,
    pub worker: WorkerSection,
    pub hls: HlsSection,
}

impl EduvidConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub media_dir: String,
    pub uploads_dir: String,
    pub data_dir: String,
    pub logs_dir: String,
}

/// Invocation surface of the external speech recognizer. The command-line
/// contract is fixed; only the values are configurable.
#[derive(Debug, Clone, Deserialize)]
pub struct RecognizerSection {
    pub enabled: bool,
    pub command: String,
    pub model: String,
    pub task: String,
    pub output_format: String,
    #[serde(default)]
    pub language: String,
    pub fp16: bool,
    pub output_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    pub concurrency: usize,
    pub poll_interval_seconds: u64,
    pub cancel_grace_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HlsSection {
    pub ffmpeg: String,
    pub segment_duration: u32,
    #[serde(default = "default_master_playlist_name")]
    pub master_playlist_name: String,
    #[serde(default = "default_variants")]
    pub variants: Vec<HlsVariant>,
}

fn default_master_playlist_name() -> String {
    crate::hls::DEFAULT_MASTER_PLAYLIST_NAME.to_string()
}

pub fn load_eduvid_config<P: AsRef<Path>>(path: P) -> Result<EduvidConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[system]
node_name = "media-01"
environment = "test"

[paths]
base_dir = "/srv/eduvid"
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
concurrency = 2
poll_interval_seconds = 5
cancel_grace_seconds = 2

[hls]
ffmpeg = "ffmpeg"
segment_duration = 6
"#;

    #[test]
    fn parses_sample_config() {
        let config: EduvidConfig = toml::from_str(SAMPLE).expect("sample config");
        assert_eq!(config.system.node_name, "media-01");
        assert!(config.recognizer.enabled);
        assert_eq!(config.recognizer.language, "");
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.hls.master_playlist_name, "master.m3u8");
    }

    #[test]
    fn hls_variants_default_to_three_renditions() {
        let config: EduvidConfig = toml::from_str(SAMPLE).expect("sample config");
        let names: Vec<&str> = config
            .hls
            .variants
            .iter()
            .map(|variant| variant.name.as_str())
            .collect();
        assert_eq!(names, ["high", "medium", "low"]);
        // ordered best quality first
        assert!(config.hls.variants[0].bandwidth > config.hls.variants[2].bandwidth);
    }

    #[test]
    fn resolve_path_joins_relative_onto_base_dir() {
        let config: EduvidConfig = toml::from_str(SAMPLE).expect("sample config");
        assert_eq!(
            config.resolve_path("media/lessons"),
            PathBuf::from("/srv/eduvid/media/lessons")
        );
        assert_eq!(config.resolve_path("/abs"), PathBuf::from("/abs"));
    }

    #[test]
    fn explicit_variant_table_overrides_defaults() {
        let raw = format!(
            "{SAMPLE}\n[[hls.variants]]\nname = \"single\"\nwidth = 640\nheight = 360\nbandwidth = 800000\nvideo_bitrate = \"800k\"\naudio_bitrate = \"96k\"\n"
        );
        let config: EduvidConfig = toml::from_str(&raw).expect("sample config");
        assert_eq!(config.hls.variants.len(), 1);
        assert_eq!(config.hls.variants[0].name, "single");
    }
}
