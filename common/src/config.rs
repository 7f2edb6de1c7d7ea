use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_target_fps")]
    pub target_fps: f64,
    #[serde(default = "default_boundary")]
    pub boundary: String,
    #[serde(default)]
    pub on_absent: AbsentPolicy,
    #[serde(default)]
    pub on_repeat: RepeatPolicy,
    #[serde(default = "default_placeholder_width")]
    pub placeholder_width: u32,
    #[serde(default = "default_placeholder_height")]
    pub placeholder_height: u32,
}

/// What a session sends on a tick where the cache has no fresh frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbsentPolicy {
    /// Send the "no frame" placeholder JPEG.
    #[default]
    Placeholder,
    /// Send nothing this tick.
    Skip,
}

/// What a session does on a tick where the newest frame was already served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatPolicy {
    /// Write the same bytes again (fixed-rate refresh).
    #[default]
    Resend,
    /// Send nothing until the sequence changes.
    Skip,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Frames older than this are reported absent. Non-positive disables aging.
    #[serde(default = "default_max_frame_age_secs")]
    pub max_frame_age_secs: f64,
    #[serde(default = "default_decode_attempts")]
    pub decode_attempts: u32,
    #[serde(default = "default_decode_backoff_ms")]
    pub decode_backoff_ms: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_dir_check_interval_ms")]
    pub dir_check_interval_ms: u64,
    /// Period of the background reaper; 0 leaves staleness purely lazy.
    #[serde(default)]
    pub reap_interval_secs: u64,
    /// Delete producer files older than the current frame by more than the max age.
    #[serde(default)]
    pub prune: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            boundary: default_boundary(),
            on_absent: AbsentPolicy::default(),
            on_repeat: RepeatPolicy::default(),
            placeholder_width: default_placeholder_width(),
            placeholder_height: default_placeholder_height(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_frame_age_secs: default_max_frame_age_secs(),
            decode_attempts: default_decode_attempts(),
            decode_backoff_ms: default_decode_backoff_ms(),
            jpeg_quality: default_jpeg_quality(),
            dir_check_interval_ms: default_dir_check_interval_ms(),
            reap_interval_secs: 0,
            prune: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl StreamConfig {
    /// Tick interval of a streaming session. Falls back to 50 ms for a non-positive fps.
    pub fn frame_interval(&self) -> Duration {
        if self.target_fps > 0.0 && self.target_fps.is_finite() {
            Duration::from_secs_f64(1.0 / self.target_fps)
        } else {
            Duration::from_millis(50)
        }
    }
}

impl IngestConfig {
    /// `None` when aging is disabled.
    pub fn max_frame_age(&self) -> Option<Duration> {
        if self.max_frame_age_secs > 0.0 && self.max_frame_age_secs.is_finite() {
            Some(Duration::from_secs_f64(self.max_frame_age_secs))
        } else {
            None
        }
    }

    pub fn decode_backoff(&self) -> Duration {
        Duration::from_millis(self.decode_backoff_ms)
    }

    pub fn dir_check_interval(&self) -> Duration {
        Duration::from_millis(self.dir_check_interval_ms.max(1))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid("at least one [[sources]] entry is required".into()));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(ConfigError::Invalid("source name must not be empty".into()));
            }
            // Names end up in `/stream/<name>` paths and in the index page.
            if !source
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                return Err(ConfigError::Invalid(format!(
                    "source name '{}' may only contain ASCII letters, digits, '-', '_' and '.'",
                    source.name
                )));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
        }
        if self.ingest.decode_attempts == 0 {
            return Err(ConfigError::Invalid("ingest.decode_attempts must be at least 1".into()));
        }
        if !(1..=100).contains(&self.ingest.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "ingest.jpeg_quality must be within 1..=100, got {}",
                self.ingest.jpeg_quality
            )));
        }
        if self.stream.boundary.is_empty() {
            return Err(ConfigError::Invalid("stream.boundary must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0:8000".into()
}
fn default_target_fps() -> f64 {
    20.0
}
fn default_boundary() -> String {
    "frame".into()
}
fn default_placeholder_width() -> u32 {
    640
}
fn default_placeholder_height() -> u32 {
    480
}
fn default_max_frame_age_secs() -> f64 {
    10.0
}
fn default_decode_attempts() -> u32 {
    5
}
fn default_decode_backoff_ms() -> u64 {
    20
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_dir_check_interval_ms() -> u64 {
    1000
}
fn default_log_level() -> String {
    "info".into()
}
