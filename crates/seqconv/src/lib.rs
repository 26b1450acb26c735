pub mod batch;
pub mod cancel;
pub mod command;
pub mod config;
pub mod encoder;
pub mod error;
pub mod events;
pub mod executor;
pub mod grouper;
pub mod pattern;
pub mod scan;

pub use batch::{convert, Batch, BatchOptions, BatchResult, ConversionOutcome, Subject};
pub use cancel::CancelToken;
pub use command::{ConversionJob, Invocation};
pub use config::{AppConfig, ConfigurationProvider, EncodingSettings, FfmpegProvider, SpeedPreset};
pub use error::{ConfigError, Error, Result};
pub use events::{BatchEvent, EventSink, LogSink, MemorySink};
pub use executor::{FailureReason, Status};
pub use grouper::Sequence;
pub use pattern::FrameToken;
