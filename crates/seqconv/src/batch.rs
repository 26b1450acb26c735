use std::fmt;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use crate::cancel::CancelToken;
use crate::command::{self, ConversionJob, OutputReservations};
use crate::config::{AppConfig, ConfigurationProvider, EncodingSettings, FfmpegProvider};
use crate::error::{ConfigError, Result};
use crate::events::{BatchEvent, EventSink, LogSink};
use crate::executor::{Execution, Executor};
use crate::grouper::{self, Sequence};
use crate::scan::DirectoryWalk;

pub use crate::executor::{FailureReason, Status};

/// What an outcome is about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subject {
    Job(Box<ConversionJob>),
    /// A sequence that never became a job
    Sequence(Box<Sequence>),
    /// A directory that could not be scanned
    Directory { path: PathBuf },
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Job(job) => {
                let output = job
                    .output_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                write!(f, "{} -> {}", job.sequence, output)
            }
            Subject::Sequence(sequence) => write!(f, "{} in {}", sequence, sequence.directory.display()),
            Subject::Directory { path } => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionOutcome {
    pub subject: Subject,
    #[serde(flatten)]
    pub status: Status,
    /// Encoder standard error or the scan error, verbatim
    pub diagnostic_text: String,
    pub exit_code: Option<i32>,
    /// Encoder launches spent on this job; 0 for scan failures
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl ConversionOutcome {
    fn failure(subject: Subject, reason: FailureReason, diagnostic_text: String) -> Self {
        ConversionOutcome {
            subject,
            status: Status::Failure(reason),
            diagnostic_text,
            exit_code: None,
            attempts: 0,
            elapsed_ms: 0,
        }
    }

    pub fn job(&self) -> Option<&ConversionJob> {
        match &self.subject {
            Subject::Job(job) => Some(job),
            _ => None,
        }
    }
}

/// Everything one batch did, in order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub succeeded: usize,
    pub failed: usize,
    /// The run stopped early on request; `outcomes` holds the work done so far
    pub cancelled: bool,
    pub outcomes: Vec<ConversionOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchResult {
    fn new() -> Self {
        let now = Utc::now();
        BatchResult {
            succeeded: 0,
            failed: 0,
            cancelled: false,
            outcomes: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    fn record(&mut self, outcome: ConversionOutcome) {
        match outcome.status {
            Status::Success => self.succeeded += 1,
            Status::Failure(_) => self.failed += 1,
            Status::Cancelled => {}
        }
        self.outcomes.push(outcome);
    }

    pub fn failures(&self) -> impl Iterator<Item = &ConversionOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_failure())
    }

    /// Nothing to convert was found and nothing went wrong.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!("{} succeeded, {} failed", self.succeeded, self.failed);
        if self.cancelled {
            line.push_str(" (cancelled)");
        }
        if self.is_empty() && !self.cancelled {
            line = "No image sequences found".to_string();
        }
        line
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub recursive: bool,
    /// Kill the running encoder on cancellation instead of letting it finish
    pub kill_in_flight: bool,
    /// Extra attempts for jobs that failed with a retryable reason
    pub max_retries: u32,
}

/// Scans a directory tree for sequences and converts each one in turn.
pub struct Batch<P, S> {
    provider: P,
    sink: S,
    options: BatchOptions,
    executor: Executor,
}

impl<P, S> Batch<P, S>
where
    P: ConfigurationProvider,
    S: EventSink,
{
    pub fn new(provider: P, sink: S, options: BatchOptions) -> Self {
        let executor = Executor::new(options.kill_in_flight);
        Batch {
            provider,
            sink,
            options,
            executor,
        }
    }

    /// Run one batch over `root`.
    ///
    /// Only configuration problems are returned as errors, and only before any
    /// directory is touched. Everything after that, including cancellation,
    /// ends up in the returned [`BatchResult`].
    pub async fn run(&self, root: &Path, cancel: &CancelToken) -> Result<BatchResult> {
        let settings = self.provider.encoding_settings();
        settings.validate()?;

        let encoder = self
            .provider
            .encoder_executable_path()
            .ok_or(ConfigError::EncoderNotFound)?;
        if !self.provider.is_encoder_available().await {
            return Err(ConfigError::EncoderUnavailable {
                path: encoder,
                reason: "availability check failed".to_string(),
            }
            .into());
        }

        // Invocations change the working directory, so paths must be absolute.
        let root = std::fs::canonicalize(root)
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| ConfigError::RootNotDirectory(root.to_path_buf()))?;

        let mut result = BatchResult::new();
        self.sink.emit(BatchEvent::ScanStarted {
            root: root.clone(),
            recursive: self.options.recursive,
        });

        let jobs = self.scan(&root, &settings, cancel, &mut result);
        if !result.cancelled {
            self.convert_jobs(&encoder, jobs, cancel, &mut result).await;
        }

        result.finished_at = Utc::now();
        self.sink.emit(BatchEvent::finished(&result));
        Ok(result)
    }

    fn scan(
        &self,
        root: &Path,
        settings: &EncodingSettings,
        cancel: &CancelToken,
        result: &mut BatchResult,
    ) -> Vec<ConversionJob> {
        let mut jobs = Vec::new();
        let mut reservations = OutputReservations::new();

        for listing in DirectoryWalk::new(root, self.options.recursive) {
            if cancel.is_cancelled() {
                result.cancelled = true;
                self.sink.emit(BatchEvent::BatchCancelled {
                    completed: result.outcomes.len(),
                    remaining: jobs.len(),
                });
                break;
            }

            let listing = match listing {
                Ok(listing) => listing,
                Err(e) => {
                    self.sink.emit(BatchEvent::DirectoryScanFailed {
                        directory: e.path.clone(),
                        error: e.to_string(),
                    });
                    result.record(ConversionOutcome::failure(
                        Subject::Directory { path: e.path.clone() },
                        FailureReason::DirectoryUnreadable,
                        e.to_string(),
                    ));
                    continue;
                }
            };

            let grouping = grouper::group_files(&listing.directory, &listing.files);

            for dup in grouping.duplicates {
                self.sink.emit(BatchEvent::DuplicateFrame {
                    index: dup.index,
                    kept: dup.kept,
                    dropped: dup.dropped,
                });
            }

            self.sink.emit(BatchEvent::DirectoryScanned {
                directory: listing.directory.clone(),
                files: listing.files.len(),
                sequences: grouping.sequences.len(),
            });

            for sequence in grouping.sequences {
                self.sink.emit(BatchEvent::SequenceDiscovered {
                    directory: sequence.directory.clone(),
                    sequence: sequence.to_string(),
                    frames: sequence.frame_count(),
                });
                if !sequence.is_contiguous() {
                    self.sink.emit(BatchEvent::SequenceGaps {
                        sequence: sequence.to_string(),
                        missing: sequence.gap_count(),
                        ranges: sequence.missing_ranges(),
                    });
                }

                // Reserve now so later sequences in the same directory see the name as taken.
                let subject = sequence.clone();
                match command::plan_job(sequence, settings, &mut reservations) {
                    Ok(job) => jobs.push(job),
                    Err(e) => result.record(ConversionOutcome::failure(
                        Subject::Sequence(Box::new(subject)),
                        FailureReason::OutputUnavailable,
                        e.to_string(),
                    )),
                }
            }
        }

        jobs
    }

    async fn convert_jobs(
        &self,
        encoder: &Path,
        jobs: Vec<ConversionJob>,
        cancel: &CancelToken,
        result: &mut BatchResult,
    ) {
        let total = jobs.len();

        for (i, job) in jobs.into_iter().enumerate() {
            if cancel.is_cancelled() {
                result.cancelled = true;
                self.sink.emit(BatchEvent::BatchCancelled {
                    completed: result.outcomes.len(),
                    remaining: total - i,
                });
                return;
            }

            let outcome = self.convert_one(encoder, job, cancel).await;
            let was_cancelled = outcome.status == Status::Cancelled;
            self.sink.emit(BatchEvent::JobFinished { outcome: outcome.clone() });
            result.record(outcome);

            if was_cancelled {
                result.cancelled = true;
                self.sink.emit(BatchEvent::BatchCancelled {
                    completed: result.outcomes.len(),
                    remaining: total - i - 1,
                });
                return;
            }
        }
    }

    async fn convert_one(&self, encoder: &Path, job: ConversionJob, cancel: &CancelToken) -> ConversionOutcome {
        let invocation = command::build_invocation(encoder, &job);
        let mut attempts = 0;
        let mut total_elapsed = 0u64;

        let execution: Execution = loop {
            attempts += 1;
            self.sink.emit(BatchEvent::JobStarted {
                job_id: job.id.to_string(),
                sequence: job.sequence.to_string(),
                output: job.output_path.clone(),
                attempt: attempts,
            });

            // Another run may have taken the name since it was reserved.
            let existed_before = tokio::fs::try_exists(&job.output_path).await.unwrap_or(true);
            let execution = self.executor.run(&invocation, cancel).await;
            total_elapsed += execution.elapsed.as_millis() as u64;

            if execution.status.is_success() {
                break execution;
            }
            if !existed_before && !execution.stderr.contains(OUTPUT_EXISTS_MARKER) {
                remove_partial_output(&job.output_path).await;
            }

            let retry = match execution.status {
                Status::Failure(reason) => {
                    reason.is_retryable() && attempts <= self.options.max_retries && !cancel.is_cancelled()
                }
                _ => false,
            };
            if !retry {
                break execution;
            }
        };

        ConversionOutcome {
            subject: Subject::Job(Box::new(job)),
            status: execution.status,
            diagnostic_text: execution.stderr,
            exit_code: execution.exit_code,
            attempts,
            elapsed_ms: total_elapsed,
        }
    }
}

/// Encoder message printed when `-n` refuses an existing output file.
const OUTPUT_EXISTS_MARKER: &str = "already exists";

/// Only called when the path was free right before this attempt started.
async fn remove_partial_output(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("Could not remove partial output {}: {}", path.display(), e),
    }
}

/// Convert every sequence under `directory` with the user's configuration.
///
/// Settings come from the default configuration file, the encoder from
/// `SEQCONV_FFMPEG_PATH`, that file, or `PATH`. Events go to the `log` facade.
pub async fn convert(directory: &Path, recursive: bool) -> Result<BatchResult> {
    let config_path = AppConfig::default_path();
    let config = AppConfig::load_config(config_path.as_deref())
        .map_err(|e| ConfigError::Load(format!("{:#}", e)))?;

    let options = BatchOptions {
        recursive,
        ..Default::default()
    };
    Batch::new(FfmpegProvider::new(config), LogSink, options)
        .run(directory, &CancelToken::new())
        .await
}
