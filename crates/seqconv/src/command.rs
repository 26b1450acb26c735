use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use serde::Serialize;
use uuid::Uuid;
use crate::config::EncodingSettings;
use crate::error::BuildError;
use crate::grouper::Sequence;

/// Candidates tried per output name before giving up.
pub const MAX_OUTPUT_CANDIDATES: u32 = 10_000;

/// Containers that benefit from moving the index to the front of the file.
const FASTSTART_CONTAINERS: &[&str] = &["mp4", "mov", "m4v"];

/// Rendered frames are full-range sRGB; players expect TV-range Rec.709.
pub const SRGB_TO_REC709: &str = "zscale=rangein=full:primariesin=bt709:transferin=iec61966-2-1:matrixin=bt709\
:range=tv:primaries=bt709:transfer=bt709:matrix=bt709";

/// H.264 profile and level for 8-bit 4:2:0 output, playable up to 1080p60.
const H264_PROFILE: &str = "high";
const H264_LEVEL: &str = "4.2";

/// One sequence bound to the settings snapshot and a reserved output path.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionJob {
    pub id: Uuid,
    pub sequence: Sequence,
    pub settings: EncodingSettings,
    pub output_path: PathBuf,
}

/// A fully resolved encoder call. Arguments are passed to the process as-is,
/// never through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
}

impl Invocation {
    /// Human-readable command line for logs. Not meant to be executed.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|a| {
                let a = a.to_string_lossy();
                if a.is_empty() || a.contains(char::is_whitespace) {
                    format!("'{}'", a)
                } else {
                    a.into_owned()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Downscale by a constant factor, keeping both dimensions even.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFilter {
    factor: f64,
}

impl ScaleFilter {
    /// `None` for a factor of 1.0: full resolution gets no filter at all.
    pub fn for_scale(factor: f64) -> Option<Self> {
        if factor >= 1.0 {
            None
        } else {
            Some(ScaleFilter { factor })
        }
    }

    /// `scale=` expression evaluated by the encoder against the input size.
    /// The comma inside `max` is escaped for the filtergraph parser.
    pub fn expression(&self) -> String {
        format!(
            "scale=max(2\\,trunc(iw*{f}/2)*2):max(2\\,trunc(ih*{f}/2)*2)",
            f = self.factor
        )
    }

    /// Same formula as [`expression`](Self::expression) for a known input size.
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        (self.scale_dimension(width), self.scale_dimension(height))
    }

    fn scale_dimension(&self, value: u32) -> u32 {
        let half = (value as f64 * self.factor / 2.0).trunc() as u32;
        (half * 2).max(2)
    }
}

/// Output paths handed out during one batch.
///
/// A path is free only if it neither exists on disk nor was reserved earlier,
/// so two jobs can never be given the same file.
#[derive(Debug, Default)]
pub struct OutputReservations {
    reserved: HashSet<PathBuf>,
}

impl OutputReservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick and reserve `<stem>.<ext>`, or `<stem>_1.<ext>`, `<stem>_2.<ext>`, ...
    pub fn reserve(&mut self, directory: &Path, stem: &str, extension: &str) -> Result<PathBuf, BuildError> {
        for n in 0..MAX_OUTPUT_CANDIDATES {
            let name = if n == 0 {
                format!("{}.{}", stem, extension)
            } else {
                format!("{}_{}.{}", stem, n, extension)
            };
            let candidate = directory.join(name);
            if candidate.exists() || self.reserved.contains(&candidate) {
                continue;
            }
            self.reserved.insert(candidate.clone());
            return Ok(candidate);
        }

        Err(BuildError::OutputExhausted(
            directory.join(format!("{}.{}", stem, extension)),
            MAX_OUTPUT_CANDIDATES,
        ))
    }

    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }
}

/// `<prefix><first>-<last>`, indices at the sequence's padding width.
pub fn output_stem(sequence: &Sequence) -> String {
    format!(
        "{}{}-{}",
        sequence.prefix,
        sequence.format_index(sequence.first_index()),
        sequence.format_index(sequence.last_index())
    )
}

/// Bind a sequence to a settings snapshot and a free output path.
pub fn plan_job(
    sequence: Sequence,
    settings: &EncodingSettings,
    reservations: &mut OutputReservations,
) -> Result<ConversionJob, BuildError> {
    let output_path = reservations.reserve(
        &sequence.directory,
        &output_stem(&sequence),
        settings.container_extension(),
    )?;

    Ok(ConversionJob {
        id: Uuid::new_v4(),
        sequence,
        settings: settings.clone(),
        output_path,
    })
}

/// `-vf` value: scale first, then color conversion and the output pixel format.
/// Empty when there is nothing to filter.
pub fn filter_chain(settings: &EncodingSettings) -> String {
    let mut filters = Vec::new();
    if let Some(scale) = ScaleFilter::for_scale(settings.resolution_scale) {
        filters.push(scale.expression());
    }
    if settings.color_conversion {
        filters.push(SRGB_TO_REC709.to_string());
        filters.push(format!("format={}", settings.pixel_format));
    }
    filters.join(",")
}

/// Encoder arguments for a job, run from the sequence's directory.
pub fn build_invocation(encoder: &Path, job: &ConversionJob) -> Invocation {
    let settings = &job.settings;
    let sequence = &job.sequence;
    let fps = settings.frame_rate.to_string();

    let mut args: Vec<OsString> = Vec::new();
    let mut push = |a: &str| args.push(OsString::from(a));

    push("-hide_banner");
    push("-nostdin");
    // Refuse to overwrite; the reservation already picked a free name.
    push("-n");

    push("-framerate");
    push(fps.as_str());
    push("-f");
    push("image2");
    // Sequences may start anywhere, image2 only looks for a first frame in 0..4.
    push("-start_number");
    push(sequence.first_index().to_string().as_str());
    push("-i");
    push(sequence.input_pattern().as_str());

    let filters = filter_chain(settings);
    if !filters.is_empty() {
        push("-vf");
        push(filters.as_str());
    }

    push("-c:v");
    push(settings.video_codec.as_str());
    push("-crf");
    push(settings.quality_factor.to_string().as_str());
    push("-preset");
    push(settings.speed_preset.as_str());
    push("-pix_fmt");
    push(settings.pixel_format.as_str());
    if settings.video_codec == "libx264" && settings.pixel_format == "yuv420p" {
        push("-profile:v");
        push(H264_PROFILE);
        push("-level");
        push(H264_LEVEL);
    }
    push("-r");
    push(fps.as_str());

    let container = settings.container_extension().to_ascii_lowercase();
    if FASTSTART_CONTAINERS.contains(&container.as_str()) {
        push("-movflags");
        push("+faststart");
    }

    args.push(job.output_path.clone().into_os_string());

    Invocation {
        program: encoder.to_path_buf(),
        args,
        working_dir: sequence.directory.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeedPreset;
    use crate::grouper::group_files;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn sequence_in(dir: &Path, names: &[&str]) -> Sequence {
        let files: Vec<PathBuf> = names.iter().map(|n| dir.join(n)).collect();
        group_files(dir, &files).sequences.remove(0)
    }

    fn job(names: &[&str], settings: EncodingSettings) -> ConversionJob {
        let dir = Path::new("/renders/shot 10");
        let mut reservations = OutputReservations::new();
        plan_job(sequence_in(dir, names), &settings, &mut reservations).unwrap()
    }

    fn arg_list(inv: &Invocation) -> Vec<String> {
        inv.args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_full_resolution_invocation() {
        let job = job(&["beauty_0101.png", "beauty_0102.png", "beauty_0104.png"], EncodingSettings::default());
        let inv = build_invocation(Path::new("/usr/bin/ffmpeg"), &job);
        let args = arg_list(&inv);

        assert_eq!(inv.program, Path::new("/usr/bin/ffmpeg"));
        assert_eq!(inv.working_dir, Path::new("/renders/shot 10"));
        assert_eq!(value_after(&args, "-start_number"), Some("101"));
        assert_eq!(value_after(&args, "-i"), Some("beauty_%04d.png"));
        assert_eq!(value_after(&args, "-crf"), Some("23"));
        assert_eq!(value_after(&args, "-preset"), Some("medium"));
        assert_eq!(value_after(&args, "-r"), Some("30"));
        assert_eq!(value_after(&args, "-framerate"), Some("30"));
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-movflags"), Some("+faststart"));
        assert_eq!(value_after(&args, "-vf"), Some(format!("{},format=yuv420p", SRGB_TO_REC709).as_str()));
        assert_eq!(value_after(&args, "-profile:v"), Some("high"));
        assert_eq!(value_after(&args, "-level"), Some("4.2"));
        assert!(args.contains(&"-n".to_string()));

        // Path with a space stays a single argument.
        assert_eq!(args.last().unwrap(), "/renders/shot 10/beauty_0101-0104.mp4");
        assert!(inv.display().ends_with("'/renders/shot 10/beauty_0101-0104.mp4'"));
    }

    #[test]
    fn test_scaled_invocation_and_settings_mapping() {
        let settings = EncodingSettings {
            resolution_scale: 0.5,
            quality_factor: 18,
            speed_preset: SpeedPreset::Slow,
            frame_rate: 23.976,
            container: "mkv".into(),
            ..Default::default()
        };
        let job = job(&["f1.jpg", "f2.jpg"], settings);
        let args = arg_list(&build_invocation(Path::new("ffmpeg"), &job));

        assert_eq!(
            value_after(&args, "-vf"),
            Some(
                format!(
                    "scale=max(2\\,trunc(iw*0.5/2)*2):max(2\\,trunc(ih*0.5/2)*2),{},format=yuv420p",
                    SRGB_TO_REC709
                )
                .as_str()
            )
        );
        assert_eq!(value_after(&args, "-crf"), Some("18"));
        assert_eq!(value_after(&args, "-preset"), Some("slow"));
        assert_eq!(value_after(&args, "-r"), Some("23.976"));
        assert_eq!(value_after(&args, "-start_number"), Some("1"));
        assert_eq!(value_after(&args, "-i"), Some("f%01d.jpg"));
        assert_eq!(value_after(&args, "-movflags"), None);
        assert!(args.last().unwrap().ends_with("f1-2.mkv"));
    }

    #[test]
    fn test_filter_chain_order() {
        let mut settings = EncodingSettings {
            resolution_scale: 0.25,
            pixel_format: "yuv444p".into(),
            ..Default::default()
        };
        assert_eq!(
            filter_chain(&settings),
            format!(
                "scale=max(2\\,trunc(iw*0.25/2)*2):max(2\\,trunc(ih*0.25/2)*2),{},format=yuv444p",
                SRGB_TO_REC709
            )
        );

        settings.color_conversion = false;
        assert_eq!(filter_chain(&settings), "scale=max(2\\,trunc(iw*0.25/2)*2):max(2\\,trunc(ih*0.25/2)*2)");

        settings.resolution_scale = 1.0;
        assert_eq!(filter_chain(&settings), "");
    }

    #[test]
    fn test_plain_invocation_without_filters_or_profile() {
        let settings = EncodingSettings {
            color_conversion: false,
            video_codec: "libx265".into(),
            ..Default::default()
        };
        let job = job(&["p_1.png", "p_2.png"], settings);
        let args = arg_list(&build_invocation(Path::new("ffmpeg"), &job));

        assert!(!args.iter().any(|a| a == "-vf" || a.contains("scale=")));
        assert!(!args.iter().any(|a| a == "-profile:v" || a == "-level"));
        assert_eq!(value_after(&args, "-c:v"), Some("libx265"));
    }

    #[test]
    fn test_output_stem_keeps_padding() {
        let seq = sequence_in(Path::new("/d"), &["shot_0001.png", "shot_0010.png"]);
        assert_eq!(output_stem(&seq), "shot_0001-0010");

        let seq = sequence_in(Path::new("/d"), &["0007.tif", "0008.tif"]);
        assert_eq!(output_stem(&seq), "0007-0008");
    }

    #[test]
    fn test_scale_filter_even_sizes() {
        assert!(ScaleFilter::for_scale(1.0).is_none());

        let half = ScaleFilter::for_scale(0.5).unwrap();
        assert_eq!(half.output_size(1920, 1080), (960, 540));
        assert_eq!(half.output_size(1919, 1081), (958, 540));

        let quarter = ScaleFilter::for_scale(0.25).unwrap();
        assert_eq!(quarter.output_size(1, 1), (2, 2));
    }

    #[test]
    fn test_reservations_avoid_existing_and_reserved() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("shot_1-9.mp4"), b"old").unwrap();
        std::fs::write(dir.path().join("shot_1-9_1.mp4"), b"old").unwrap();

        let mut reservations = OutputReservations::new();
        let first = reservations.reserve(dir.path(), "shot_1-9", "mp4").unwrap();
        let second = reservations.reserve(dir.path(), "shot_1-9", "mp4").unwrap();

        assert_eq!(first, dir.path().join("shot_1-9_2.mp4"));
        assert_eq!(second, dir.path().join("shot_1-9_3.mp4"));
        assert_eq!(reservations.len(), 2);
        assert_eq!(std::fs::read(dir.path().join("shot_1-9.mp4")).unwrap(), b"old");
    }

    #[test]
    fn test_jobs_get_distinct_ids() {
        let a = job(&["a1.png", "a2.png"], EncodingSettings::default());
        let b = job(&["a1.png", "a2.png"], EncodingSettings::default());
        assert_ne!(a.id, b.id);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn test_scaled_dimensions_always_even(
            scale in 0.001f64..1.0,
            width in 1u32..8000,
            height in 1u32..8000,
        ) {
            let filter = ScaleFilter::for_scale(scale).unwrap();
            let (w, h) = filter.output_size(width, height);
            prop_assert_eq!(w % 2, 0);
            prop_assert_eq!(h % 2, 0);
            prop_assert!(w >= 2 && h >= 2);
            let expr = filter.expression();
            prop_assert!(expr.contains("/2)*2"));
            prop_assert_eq!(expr.matches("max(2\\,").count(), 2);
        }
    }
}
