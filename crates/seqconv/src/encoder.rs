use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::process::Command;
use crate::error::ConfigError;

/// Environment variable naming the encoder executable; wins over the config file.
pub const ENCODER_PATH_ENV: &str = "SEQCONV_FFMPEG_PATH";

#[cfg(windows)]
const EXECUTABLE_NAME: &str = "ffmpeg.exe";
#[cfg(not(windows))]
const EXECUTABLE_NAME: &str = "ffmpeg";

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Encoder version as reported on the first line of `-version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncoderVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EncoderVersion {
    /// Parse the `ffmpeg version X.Y[.Z]` banner.
    ///
    /// Release builds report `8.0.1`, distro builds `6.1.1-3ubuntu5`, static
    /// builds `n7.0`. Git snapshots (`N-113024-g...`) have no release number
    /// and fail to parse.
    pub fn parse(banner: &str) -> Result<Self> {
        let token = banner
            .split_whitespace()
            .skip_while(|w| *w != "version")
            .nth(1)
            .ok_or_else(|| anyhow!("No version token in: {}", banner))?;

        let numeric: String = token
            .trim_start_matches('n')
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if numeric.is_empty() {
            return Err(anyhow!("Version token is not a release number: {}", token));
        }

        let mut parts = numeric.split('.').filter(|p| !p.is_empty());
        let mut next = |name: &str| -> Result<u32> {
            match parts.next() {
                Some(p) => p
                    .parse::<u32>()
                    .with_context(|| format!("Failed to parse {} version from: {}", name, p)),
                None => Ok(0),
            }
        };

        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        Ok(EncoderVersion { major, minor, patch })
    }
}

impl std::fmt::Display for EncoderVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A located and validated encoder
#[derive(Debug, Clone, Serialize)]
pub struct EncoderInfo {
    pub path: PathBuf,
    pub banner: String,
    pub version: Option<EncoderVersion>,
}

/// Find the encoder: env var, then the configured path, then `PATH`.
pub fn locate_encoder(configured: Option<&Path>) -> Option<PathBuf> {
    resolve_encoder(
        std::env::var_os(ENCODER_PATH_ENV).map(PathBuf::from),
        configured,
        std::env::var_os("PATH"),
    )
}

fn resolve_encoder(
    from_env: Option<PathBuf>,
    configured: Option<&Path>,
    path_var: Option<OsString>,
) -> Option<PathBuf> {
    from_env
        .into_iter()
        .chain(configured.map(Path::to_path_buf))
        .find(|p| p.is_file())
        .or_else(|| {
            path_var.and_then(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(EXECUTABLE_NAME))
                    .find(|candidate| candidate.is_file())
            })
        })
        .map(|p| std::fs::canonicalize(&p).unwrap_or(p))
}

/// Run `<encoder> -version` and confirm it starts and exits cleanly.
pub async fn check_encoder(path: &Path) -> std::result::Result<EncoderInfo, ConfigError> {
    let unavailable = |reason: String| ConfigError::EncoderUnavailable {
        path: path.to_path_buf(),
        reason,
    };

    let mut cmd = Command::new(path);
    cmd.arg("-version").kill_on_drop(true);

    let output = tokio::time::timeout(VERSION_TIMEOUT, cmd.output())
        .await
        .map_err(|_| unavailable(format!("`-version` did not finish within {}s", VERSION_TIMEOUT.as_secs())))?
        .map_err(|e| unavailable(format!("failed to execute: {}", e)))?;

    if !output.status.success() {
        return Err(unavailable(format!(
            "`-version` exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let banner = stdout.lines().next().unwrap_or_default().trim().to_string();
    let version = EncoderVersion::parse(&banner).ok();

    Ok(EncoderInfo {
        path: path.to_path_buf(),
        banner,
        version,
    })
}
