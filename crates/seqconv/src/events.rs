use std::path::PathBuf;
use std::sync::Mutex;
use log::{debug, info, warn};
use serde::Serialize;
use crate::batch::{BatchResult, ConversionOutcome, Status};

/// Diagnostic events raised while a batch runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    ScanStarted { root: PathBuf, recursive: bool },
    DirectoryScanned { directory: PathBuf, files: usize, sequences: usize },
    SequenceDiscovered { directory: PathBuf, sequence: String, frames: usize },
    DuplicateFrame { index: u64, kept: PathBuf, dropped: PathBuf },
    SequenceGaps { sequence: String, missing: u64, ranges: Vec<(u64, u64)> },
    DirectoryScanFailed { directory: PathBuf, error: String },
    JobStarted { job_id: String, sequence: String, output: PathBuf, attempt: u32 },
    JobFinished { outcome: ConversionOutcome },
    BatchCancelled { completed: usize, remaining: usize },
    BatchFinished { succeeded: usize, failed: usize, cancelled: bool },
}

impl BatchEvent {
    pub(crate) fn finished(result: &BatchResult) -> Self {
        BatchEvent::BatchFinished {
            succeeded: result.succeeded,
            failed: result.failed,
            cancelled: result.cancelled,
        }
    }
}

/// Receiver for [`BatchEvent`]s. The pipeline never writes logs itself.
pub trait EventSink {
    fn emit(&self, event: BatchEvent);
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: BatchEvent) {
        match event {
            BatchEvent::ScanStarted { root, recursive } => {
                info!("Scanning {}{}", root.display(), if recursive { " (recursive)" } else { "" });
            }
            BatchEvent::DirectoryScanned { directory, files, sequences } => {
                debug!("Scanned {}: {} files, {} sequence(s)", directory.display(), files, sequences);
            }
            BatchEvent::SequenceDiscovered { directory, sequence, frames } => {
                info!("Found sequence {} ({} frames) in {}", sequence, frames, directory.display());
            }
            BatchEvent::DuplicateFrame { index, kept, dropped } => {
                warn!(
                    "Duplicate frame {}: using {}, ignoring {}",
                    index,
                    kept.display(),
                    dropped.display()
                );
            }
            BatchEvent::SequenceGaps { sequence, missing, ranges } => {
                let ranges: Vec<String> = ranges
                    .iter()
                    .map(|(a, b)| if a == b { a.to_string() } else { format!("{}-{}", a, b) })
                    .collect();
                warn!("Sequence {} is missing {} frame(s): {}", sequence, missing, ranges.join(", "));
            }
            BatchEvent::DirectoryScanFailed { directory, error } => {
                warn!("Skipping {}: {}", directory.display(), error);
            }
            BatchEvent::JobStarted { job_id, sequence, output, attempt } => {
                if attempt > 1 {
                    info!("Retrying {} -> {} (attempt {}, job {})", sequence, output.display(), attempt, job_id);
                } else {
                    info!("Converting {} -> {} (job {})", sequence, output.display(), job_id);
                }
            }
            BatchEvent::JobFinished { outcome } => match &outcome.status {
                Status::Success => info!("✅ {} ({} ms)", outcome.subject, outcome.elapsed_ms),
                Status::Failure(reason) => {
                    warn!("❌ {} failed: {}", outcome.subject, reason);
                    if !outcome.diagnostic_text.is_empty() {
                        debug!("Encoder output:\n{}", outcome.diagnostic_text);
                    }
                }
                Status::Cancelled => warn!("⏹️  {} cancelled", outcome.subject),
            },
            BatchEvent::BatchCancelled { completed, remaining } => {
                warn!("Batch cancelled after {} item(s), {} job(s) not started", completed, remaining);
            }
            BatchEvent::BatchFinished { succeeded, failed, cancelled } => {
                info!(
                    "Batch {}: {} succeeded, {} failed",
                    if cancelled { "cancelled" } else { "complete" },
                    succeeded,
                    failed
                );
            }
        }
    }
}

/// Keeps every event in memory, in order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<BatchEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BatchEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: BatchEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl<S: EventSink + ?Sized> EventSink for &S {
    fn emit(&self, event: BatchEvent) {
        (**self).emit(event)
    }
}
