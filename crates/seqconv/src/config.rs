use std::fmt;
use std::future::Future;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use crate::encoder;
use crate::error::ConfigError;

/// Accepted CRF values (the x264/x265 scale).
pub const QUALITY_RANGE: RangeInclusive<i32> = 0..=51;

/// Encoder speed/efficiency tradeoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedPreset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    Veryslow,
    Placebo,
}

impl SpeedPreset {
    pub const ALL: [SpeedPreset; 10] = [
        SpeedPreset::Ultrafast,
        SpeedPreset::Superfast,
        SpeedPreset::Veryfast,
        SpeedPreset::Faster,
        SpeedPreset::Fast,
        SpeedPreset::Medium,
        SpeedPreset::Slow,
        SpeedPreset::Slower,
        SpeedPreset::Veryslow,
        SpeedPreset::Placebo,
    ];

    /// Value passed to `-preset`
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedPreset::Ultrafast => "ultrafast",
            SpeedPreset::Superfast => "superfast",
            SpeedPreset::Veryfast => "veryfast",
            SpeedPreset::Faster => "faster",
            SpeedPreset::Fast => "fast",
            SpeedPreset::Medium => "medium",
            SpeedPreset::Slow => "slow",
            SpeedPreset::Slower => "slower",
            SpeedPreset::Veryslow => "veryslow",
            SpeedPreset::Placebo => "placebo",
        }
    }
}

impl fmt::Display for SpeedPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpeedPreset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        SpeedPreset::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let names: Vec<&str> = SpeedPreset::ALL.iter().map(|p| p.as_str()).collect();
                format!("unknown preset {:?} (expected one of: {})", s, names.join(", "))
            })
    }
}

/// Encoding parameters for one batch. Taken as an immutable snapshot per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingSettings {
    /// Output size relative to the frames, in (0, 1]
    pub resolution_scale: f64,
    /// Constant rate factor, lower is better quality
    #[serde(alias = "crf")]
    pub quality_factor: i32,
    #[serde(alias = "preset")]
    pub speed_preset: SpeedPreset,
    /// Frames per second, used for both input timing and output rate
    #[serde(alias = "framerate")]
    pub frame_rate: f64,
    pub video_codec: String,
    pub pixel_format: String,
    /// Output file extension, e.g. `mp4`
    pub container: String,
    /// Convert full-range sRGB frames to TV-range Rec.709 before encoding
    pub color_conversion: bool,
}

impl Default for EncodingSettings {
    fn default() -> Self {
        Self {
            resolution_scale: 1.0,
            quality_factor: 23,
            speed_preset: SpeedPreset::Medium,
            frame_rate: 30.0,
            video_codec: "libx264".to_string(),
            pixel_format: "yuv420p".to_string(),
            container: "mp4".to_string(),
            color_conversion: true,
        }
    }
}

impl EncodingSettings {
    /// Bounds-check every field. Nothing is clamped.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let scale = self.resolution_scale;
        if !scale.is_finite() || scale <= 0.0 || scale > 1.0 {
            return Err(ConfigError::InvalidScale(scale));
        }

        if !QUALITY_RANGE.contains(&self.quality_factor) {
            return Err(ConfigError::QualityOutOfRange {
                value: self.quality_factor,
                min: *QUALITY_RANGE.start(),
                max: *QUALITY_RANGE.end(),
            });
        }

        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            return Err(ConfigError::InvalidFrameRate(self.frame_rate));
        }

        if self.video_codec.trim().is_empty() {
            return Err(ConfigError::EmptySetting("video_codec"));
        }
        if self.pixel_format.trim().is_empty() {
            return Err(ConfigError::EmptySetting("pixel_format"));
        }

        let container = self.container.trim_start_matches('.');
        if container.is_empty()
            || container.contains(['/', '\\', '.'])
            || container.chars().any(char::is_whitespace)
        {
            return Err(ConfigError::InvalidContainer(self.container.clone()));
        }

        Ok(())
    }

    /// Container extension without a leading dot
    pub fn container_extension(&self) -> &str {
        self.container.trim_start_matches('.')
    }
}

/// Parse `full`, `half`, `quarter` or a decimal factor.
pub fn parse_resolution_scale(s: &str) -> std::result::Result<f64, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "full" => Ok(1.0),
        "half" => Ok(0.5),
        "quarter" => Ok(0.25),
        other => other
            .parse::<f64>()
            .map_err(|_| format!("invalid resolution {:?} (use full, half, quarter or a number)", s)),
    }
}

/// On-disk configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Encoder executable; falls back to `PATH` lookup when unset
    pub ffmpeg_path: Option<PathBuf>,
    pub encoding: EncodingSettings,
}

impl AppConfig {
    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let Some(config_path) = path else {
            return Ok(Self::default());
        };

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))
        }
    }

    /// `config.toml` under the per-user configuration directory
    pub fn default_path() -> Option<PathBuf> {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
            .or_else(|| std::env::var_os("LOCALAPPDATA").map(PathBuf::from))?;
        Some(base.join("seqconv").join("config.toml"))
    }
}

/// Source of settings and the encoder for a batch.
pub trait ConfigurationProvider {
    fn encoding_settings(&self) -> EncodingSettings;

    /// Absolute path of the encoder, if one was found
    fn encoder_executable_path(&self) -> Option<PathBuf>;

    fn is_encoder_available(&self) -> impl Future<Output = bool> + Send;
}

/// Provider backed by an [`AppConfig`] and the ffmpeg found through it.
#[derive(Debug, Clone)]
pub struct FfmpegProvider {
    config: AppConfig,
    encoder: Option<PathBuf>,
}

impl FfmpegProvider {
    pub fn new(config: AppConfig) -> Self {
        let encoder = encoder::locate_encoder(config.ffmpeg_path.as_deref());
        FfmpegProvider { config, encoder }
    }

    /// Use `encoder` as-is, skipping discovery.
    pub fn with_encoder(config: AppConfig, encoder: PathBuf) -> Self {
        FfmpegProvider {
            config,
            encoder: Some(encoder),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

impl ConfigurationProvider for FfmpegProvider {
    fn encoding_settings(&self) -> EncodingSettings {
        self.config.encoding.clone()
    }

    fn encoder_executable_path(&self) -> Option<PathBuf> {
        self.encoder.clone()
    }

    async fn is_encoder_available(&self) -> bool {
        let Some(path) = self.encoder.as_deref() else {
            warn!("Encoder not found in {}, config file, or PATH", encoder::ENCODER_PATH_ENV);
            return false;
        };

        match encoder::check_encoder(path).await {
            Ok(found) => {
                match &found.version {
                    Some(version) => info!("Using ffmpeg {} at {}", version, found.path.display()),
                    None => info!("Using encoder {} ({})", found.path.display(), found.banner),
                }
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }
}
