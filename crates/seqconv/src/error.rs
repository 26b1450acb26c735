use std::path::PathBuf;
use thiserror::Error;

/// Invalid settings or an unusable encoder. Fatal: raised before any directory is scanned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("resolution scale must be in (0, 1], got {0}")]
    InvalidScale(f64),

    #[error("quality factor {value} is outside the accepted range {min}..={max}")]
    QualityOutOfRange { value: i32, min: i32, max: i32 },

    #[error("frame rate must be a positive finite number, got {0}")]
    InvalidFrameRate(f64),

    #[error("setting `{0}` must not be empty")]
    EmptySetting(&'static str),

    #[error("invalid container extension: {0:?}")]
    InvalidContainer(String),

    #[error("no encoder executable found (set SEQCONV_FFMPEG_PATH, `ffmpeg_path` in the config file, or put ffmpeg on PATH)")]
    EncoderNotFound,

    #[error("encoder at {path} is not usable: {reason}")]
    EncoderUnavailable { path: PathBuf, reason: String },

    #[error("not a directory: {0}")]
    RootNotDirectory(PathBuf),

    #[error("failed to load configuration: {0}")]
    Load(String),
}

/// A directory that could not be listed. Recorded per directory; the walk continues.
#[derive(Debug, Error)]
#[error("cannot list directory {path}: {source}")]
pub struct ScanError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl ScanError {
    pub fn from_walkdir(path: PathBuf, err: walkdir::Error) -> Self {
        let message = err.to_string();
        let source = err
            .into_io_error()
            .unwrap_or_else(|| std::io::Error::other(message));
        ScanError { path, source }
    }
}

/// A job that could not be turned into an encoder invocation.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no free output name next to {0} after {1} attempts")]
    OutputExhausted(PathBuf, u32),
}

/// The only error a batch run returns; everything else ends up in the `BatchResult`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
