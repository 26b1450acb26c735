use std::path::PathBuf;
use std::process::ExitCode;
use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use seqconv::config::parse_resolution_scale;
use seqconv::{
    AppConfig, Batch, BatchOptions, BatchResult, CancelToken, FfmpegProvider, LogSink, SpeedPreset,
};

/// Environment variable that turns on debug logging, like `--verbose`.
const DEBUG_ENV: &str = "SEQCONV_DEBUG";

/// Convert numbered image sequences into videos
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory containing image sequences
    directory: PathBuf,

    /// Also convert sequences in subdirectories
    #[arg(short, long)]
    recursive: bool,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output resolution: full, half, quarter or a factor in (0, 1]
    #[arg(long, value_parser = parse_resolution_scale)]
    scale: Option<f64>,

    /// Constant rate factor (0-51, lower is better)
    #[arg(long)]
    crf: Option<i32>,

    /// Encoder speed preset
    #[arg(long)]
    preset: Option<SpeedPreset>,

    /// Frames per second
    #[arg(long)]
    fps: Option<f64>,

    /// Video codec passed to the encoder
    #[arg(long)]
    codec: Option<String>,

    /// Keep the frames' color range instead of converting to Rec.709 TV range
    #[arg(long)]
    no_color_conversion: bool,

    /// Encoder executable, skipping discovery
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Extra attempts for jobs whose encoder crashed
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Kill the running encoder on Ctrl+C instead of letting it finish
    #[arg(long)]
    kill_on_cancel: bool,

    /// Print the full result as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn debug_env_enabled() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // RUST_LOG still wins over the default chosen here
    let default_level = if args.verbose || debug_env_enabled() { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let config_path = args.config.clone().or_else(AppConfig::default_path);
    let mut cfg = AppConfig::load_config(config_path.as_deref())
        .context("Failed to load configuration")?;
    apply_overrides(&mut cfg, &args);

    info!("Encoding settings:");
    info!("  Resolution scale: {}", cfg.encoding.resolution_scale);
    info!("  CRF: {}", cfg.encoding.quality_factor);
    info!("  Preset: {}", cfg.encoding.speed_preset);
    info!("  Frame rate: {}", cfg.encoding.frame_rate);
    info!("  Codec: {} ({}, .{})", cfg.encoding.video_codec, cfg.encoding.pixel_format, cfg.encoding.container_extension());
    info!("  Color conversion: {}", if cfg.encoding.color_conversion { "sRGB -> Rec.709" } else { "off" });

    let provider = match args.ffmpeg.clone() {
        Some(path) => {
            let path = std::fs::canonicalize(&path).unwrap_or(path);
            FfmpegProvider::with_encoder(cfg, path)
        }
        None => FfmpegProvider::new(cfg),
    };

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("⏹️  Cancellation requested, stopping after the current job");
                cancel.cancel();
            }
        });
    }

    let options = BatchOptions {
        recursive: args.recursive,
        kill_in_flight: args.kill_on_cancel,
        max_retries: args.retries,
    };
    let result = Batch::new(provider, LogSink, options)
        .run(&args.directory, &cancel)
        .await
        .with_context(|| format!("Cannot convert {}", args.directory.display()))?;

    if args.json {
        let json = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
        println!("{}", json);
    } else {
        print_summary(&result);
    }

    Ok(exit_code(&result))
}

fn apply_overrides(cfg: &mut AppConfig, args: &Args) {
    let enc = &mut cfg.encoding;
    if let Some(scale) = args.scale {
        enc.resolution_scale = scale;
    }
    if let Some(crf) = args.crf {
        enc.quality_factor = crf;
    }
    if let Some(preset) = args.preset {
        enc.speed_preset = preset;
    }
    if let Some(fps) = args.fps {
        enc.frame_rate = fps;
    }
    if let Some(codec) = &args.codec {
        enc.video_codec = codec.clone();
    }
    if args.no_color_conversion {
        enc.color_conversion = false;
    }
    if let Some(ffmpeg) = &args.ffmpeg {
        cfg.ffmpeg_path = Some(ffmpeg.clone());
    }
}

fn print_summary(result: &BatchResult) {
    println!();
    println!("Conversion summary: {}", result.summary_line());
    for outcome in result.outcomes.iter().filter(|o| o.status.is_success()) {
        if let Some(job) = outcome.job() {
            println!("  ✅ {}", job.output_path.display());
        }
    }
    for outcome in result.failures() {
        println!("  ❌ {}: {}", outcome.subject, outcome.status);
        if let Some(last) = outcome.diagnostic_text.lines().rev().find(|l| !l.trim().is_empty()) {
            println!("     {}", last.trim());
        }
    }
}

fn exit_code(result: &BatchResult) -> ExitCode {
    if result.cancelled {
        ExitCode::from(130)
    } else if result.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_and_overrides() {
        let args = Args::try_parse_from([
            "seqconv", "/renders", "-r", "--scale", "half", "--crf", "18", "--preset", "slow", "--fps", "24",
        ])
        .unwrap();
        assert!(args.recursive);

        let mut cfg = AppConfig::default();
        apply_overrides(&mut cfg, &args);
        assert_eq!(cfg.encoding.resolution_scale, 0.5);
        assert_eq!(cfg.encoding.quality_factor, 18);
        assert_eq!(cfg.encoding.speed_preset, SpeedPreset::Slow);
        assert_eq!(cfg.encoding.frame_rate, 24.0);
        assert_eq!(cfg.encoding.video_codec, "libx264");
        assert!(cfg.encoding.color_conversion);

        let args = Args::try_parse_from(["seqconv", "/renders", "--no-color-conversion"]).unwrap();
        apply_overrides(&mut cfg, &args);
        assert!(!cfg.encoding.color_conversion);
        assert_eq!(cfg.encoding.quality_factor, 18);
    }

    #[test]
    fn test_bad_preset_is_rejected() {
        assert!(Args::try_parse_from(["seqconv", "/renders", "--preset", "turbo"]).is_err());
        assert!(Args::try_parse_from(["seqconv", "/renders", "--scale", "huge"]).is_err());
    }
}
