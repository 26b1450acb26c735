use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use log::{debug, trace};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use crate::cancel::CancelToken;
use crate::command::Invocation;

/// Encoder messages that mean the frames (or the output target) were unusable.
const INVALID_INPUT_MARKERS: &[&str] = &[
    "No such file or directory",
    "Invalid data found",
    "Could not find codec parameters",
    "does not contain any stream",
    "Error opening input",
    "Invalid argument",
    "already exists",
];

/// Why an item of a batch did not produce a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    EncoderNotFound,
    InvalidInput,
    EncoderCrashed,
    Unknown,
    /// A directory could not be listed
    DirectoryUnreadable,
    /// No free output file name was left
    OutputUnavailable,
}

impl FailureReason {
    /// Failures worth another attempt under a retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::EncoderCrashed | FailureReason::Unknown)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::EncoderNotFound => "encoder not found",
            FailureReason::InvalidInput => "invalid input",
            FailureReason::EncoderCrashed => "encoder crashed",
            FailureReason::Unknown => "unknown encoder error",
            FailureReason::DirectoryUnreadable => "directory unreadable",
            FailureReason::OutputUnavailable => "no output name available",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Status {
    Success,
    Failure(FailureReason),
    /// Stopped by a cancellation request before the encoder finished
    Cancelled,
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Failure(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => f.write_str("success"),
            Status::Failure(reason) => write!(f, "failed ({})", reason),
            Status::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Result of a single encoder process.
#[derive(Debug, Clone)]
pub struct Execution {
    pub status: Status,
    pub exit_code: Option<i32>,
    /// Standard error, verbatim
    pub stderr: String,
    pub elapsed: Duration,
}

/// Map an encoder exit to a failure class.
///
/// `exit_code` is `None` when the process was terminated by a signal.
pub fn classify_failure(exit_code: Option<i32>, stderr: &str) -> FailureReason {
    if matches!(exit_code, Some(126) | Some(127)) {
        return FailureReason::EncoderNotFound;
    }

    if INVALID_INPUT_MARKERS.iter().any(|m| stderr.contains(m)) {
        return FailureReason::InvalidInput;
    }

    match exit_code {
        None => FailureReason::EncoderCrashed,
        // NTSTATUS error codes: access violation, stack overflow, ...
        Some(code) if code as u32 >= 0xC000_0000 => FailureReason::EncoderCrashed,
        Some(code) if cfg!(unix) && code > 128 => FailureReason::EncoderCrashed,
        Some(_) => FailureReason::Unknown,
    }
}

/// Runs encoder invocations, one child process per call, no retries.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    kill_in_flight: bool,
}

impl Executor {
    /// With `kill_in_flight`, a cancellation request kills the running encoder;
    /// otherwise the encoder is left to finish.
    pub fn new(kill_in_flight: bool) -> Self {
        Executor { kill_in_flight }
    }

    pub async fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Execution {
        let started = Instant::now();
        debug!("Executing encoder: {}", invocation.display());

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = match e.kind() {
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                        FailureReason::EncoderNotFound
                    }
                    _ => FailureReason::Unknown,
                };
                return Execution {
                    status: Status::Failure(reason),
                    exit_code: None,
                    stderr: format!("Failed to start {}: {}", invocation.program.display(), e),
                    elapsed: started.elapsed(),
                };
            }
        };

        if let Some(pid) = child.id() {
            debug!("Encoder started with pid {}", pid);
        }

        let stdout_handle = child.stdout.take().map(collect_output);
        let stderr_handle = child.stderr.take().map(collect_output);

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled(), if self.kill_in_flight => None,
        };

        let status = match waited {
            Some(status) => status,
            None => {
                if let Err(e) = child.kill().await {
                    debug!("Failed to kill encoder: {}", e);
                }
                // Grandchildren may still hold the pipes open.
                for handle in [stdout_handle, stderr_handle].into_iter().flatten() {
                    handle.abort();
                }
                return Execution {
                    status: Status::Cancelled,
                    exit_code: None,
                    stderr: String::new(),
                    elapsed: started.elapsed(),
                };
            }
        };

        let stdout = join_output(stdout_handle).await;
        let stderr = join_output(stderr_handle).await;
        if !stdout.is_empty() {
            trace!("Encoder stdout:\n{}", stdout);
        }

        let elapsed = started.elapsed();
        match status {
            Ok(status) if status.success() => Execution {
                status: Status::Success,
                exit_code: status.code(),
                stderr,
                elapsed,
            },
            Ok(status) => Execution {
                status: Status::Failure(classify_failure(status.code(), &stderr)),
                exit_code: status.code(),
                stderr,
                elapsed,
            },
            Err(e) => Execution {
                status: Status::Failure(FailureReason::Unknown),
                exit_code: None,
                stderr: format!("Failed to wait for encoder: {}\n{}", e, stderr),
                elapsed,
            },
        }
    }
}

fn collect_output<R>(mut reader: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    // Reads to EOF even past invalid UTF-8 so the child never blocks on a full pipe.
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf).await {
            trace!("Output stream ended early: {}", e);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn join_output(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::path::PathBuf;

    #[test]
    fn test_classify_failure() {
        assert_eq!(classify_failure(Some(127), ""), FailureReason::EncoderNotFound);
        assert_eq!(classify_failure(Some(126), ""), FailureReason::EncoderNotFound);
        assert_eq!(
            classify_failure(Some(1), "shot_%04d.png: No such file or directory"),
            FailureReason::InvalidInput
        );
        assert_eq!(
            classify_failure(Some(1), "File 'out.mp4' already exists. Exiting."),
            FailureReason::InvalidInput
        );
        assert_eq!(classify_failure(None, "Segmentation fault"), FailureReason::EncoderCrashed);
        assert_eq!(classify_failure(Some(-1073741819), ""), FailureReason::EncoderCrashed);
        assert_eq!(classify_failure(Some(1), "Conversion failed!"), FailureReason::Unknown);
    }

    #[cfg(unix)]
    #[test]
    fn test_high_exit_codes_are_crashes_on_unix() {
        assert_eq!(classify_failure(Some(139), ""), FailureReason::EncoderCrashed);
    }

    #[test]
    fn test_retryable_reasons() {
        assert!(FailureReason::EncoderCrashed.is_retryable());
        assert!(FailureReason::Unknown.is_retryable());
        assert!(!FailureReason::InvalidInput.is_retryable());
        assert!(!FailureReason::EncoderNotFound.is_retryable());
        assert!(!FailureReason::DirectoryUnreadable.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_program_is_encoder_not_found() {
        let inv = Invocation {
            program: PathBuf::from("/nonexistent/seqconv-test/ffmpeg"),
            args: vec![],
            working_dir: std::env::temp_dir(),
        };
        let exec = Executor::default().run(&inv, &CancelToken::new()).await;
        assert_eq!(exec.status, Status::Failure(FailureReason::EncoderNotFound));
        assert!(exec.stderr.contains("Failed to start"));
    }

    #[cfg(unix)]
    fn sh(script: &str) -> Invocation {
        Invocation {
            program: PathBuf::from("/bin/sh"),
            args: vec![OsString::from("-c"), OsString::from(script)],
            working_dir: std::env::temp_dir(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_and_stderr_capture() {
        let exec = Executor::default()
            .run(&sh("echo noise; echo 'frame=10' >&2; exit 0"), &CancelToken::new())
            .await;
        assert_eq!(exec.status, Status::Success);
        assert_eq!(exec.exit_code, Some(0));
        assert_eq!(exec.stderr, "frame=10\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_keeps_diagnostics_verbatim() {
        let exec = Executor::default()
            .run(
                &sh("echo 'in_%04d.png: Invalid data found when processing input' >&2; exit 1"),
                &CancelToken::new(),
            )
            .await;
        assert_eq!(exec.status, Status::Failure(FailureReason::InvalidInput));
        assert_eq!(exec.exit_code, Some(1));
        assert_eq!(exec.stderr, "in_%04d.png: Invalid data found when processing input\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_utf8_does_not_truncate_diagnostics() {
        let exec = Executor::default()
            .run(
                &sh("printf 'bad \\377 byte\\n' >&2; sleep 0.3; echo tail >&2; exit 0"),
                &CancelToken::new(),
            )
            .await;
        assert_eq!(exec.status, Status::Success);
        assert!(exec.stderr.contains('\u{FFFD}'), "{:?}", exec.stderr);
        assert!(exec.stderr.contains("bad "));
        assert!(exec.stderr.ends_with("tail\n"), "{:?}", exec.stderr);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_in_flight() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let exec = tokio::time::timeout(
            Duration::from_secs(10),
            Executor::new(true).run(&sh("exec sleep 30"), &cancel),
        )
        .await
        .unwrap();
        assert_eq!(exec.status, Status::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_without_kill_lets_encoder_finish() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let exec = Executor::new(false).run(&sh("exit 0"), &cancel).await;
        assert_eq!(exec.status, Status::Success);
    }
}
