use std::path::{Path, PathBuf};
use serde::Serialize;

/// Extensions that are never frames: EXR needs its own colour pipeline, and
/// movie containers are what this tool writes, so they must not be regrouped.
const EXCLUDED_EXTENSIONS: &[&str] = &[
    "exr", "mp4", "mov", "avi", "mkv", "webm", "flv", "wmv", "m4v", "mpg", "mpeg", "m2v", "mxf",
];

/// One file name split around its trailing frame number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameToken {
    pub prefix: String,
    pub index: u64,
    /// Literal digit count, so `7`, `07` and `007` are three different widths.
    pub padding_width: usize,
    pub suffix: String,
    pub extension: String,
    pub source_path: PathBuf,
}

impl FrameToken {
    pub fn file_name(&self) -> &str {
        self.source_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Parse a path's file name into a [`FrameToken`].
///
/// Returns `None` when the stem does not end in ASCII digits, when the name is
/// not valid UTF-8, when the number does not fit in a `u64`, or when the
/// extension is excluded.
pub fn parse_frame(path: &Path) -> Option<FrameToken> {
    let name = path.file_name()?.to_str()?;
    let (stem, extension) = split_extension(name);

    if is_excluded_extension(extension) {
        return None;
    }

    let digits_start = stem
        .char_indices()
        .rev()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let digits = &stem[digits_start..];
    if digits.is_empty() {
        return None;
    }
    let index = digits.parse::<u64>().ok()?;

    Some(FrameToken {
        prefix: stem[..digits_start].to_string(),
        index,
        padding_width: digits.len(),
        suffix: String::new(),
        extension: extension.to_string(),
        source_path: path.to_path_buf(),
    })
}

pub fn is_excluded_extension(extension: &str) -> bool {
    EXCLUDED_EXTENSIONS
        .iter()
        .any(|ex| ex.eq_ignore_ascii_case(extension))
}

/// Split at the last dot. A leading dot (hidden file) is part of the stem.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        None | Some(0) => (name, ""),
        Some(i) => (&name[..i], &name[i + 1..]),
    }
}

/// image2 patterns treat `%` as a directive, so literal percents are doubled.
pub(crate) fn escape_pattern_literal(s: &str) -> String {
    s.replace('%', "%%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parse(name: &str) -> Option<FrameToken> {
        parse_frame(Path::new(name))
    }

    #[test]
    fn test_trailing_digits_before_extension() {
        let t = parse("shot_0042.png").unwrap();
        assert_eq!(t.prefix, "shot_");
        assert_eq!(t.index, 42);
        assert_eq!(t.padding_width, 4);
        assert_eq!(t.suffix, "");
        assert_eq!(t.extension, "png");
        assert_eq!(t.file_name(), "shot_0042.png");
    }

    #[test]
    fn test_digits_not_at_end_of_stem() {
        assert!(parse("render_01_preview.tif").is_none());
        assert!(parse("thumb.png").is_none());
        assert!(parse("frame.0001.beauty.jpg").is_none());
    }

    #[test]
    fn test_padding_is_literal_digit_count() {
        assert_eq!(parse("a007.png").unwrap().padding_width, 3);
        assert_eq!(parse("a7.png").unwrap().padding_width, 1);
        assert_eq!(parse("a007.png").unwrap().index, parse("a7.png").unwrap().index);
    }

    #[test]
    fn test_excluded_extensions() {
        assert!(parse("plate_0001.exr").is_none());
        assert!(parse("plate_0001.EXR").is_none());
        assert!(parse("shot_0001-0010.mp4").is_none());
        assert!(parse("clip_3.MOV").is_none());
    }

    #[test]
    fn test_all_digit_stem_and_missing_extension() {
        let t = parse("0001.jpg").unwrap();
        assert_eq!(t.prefix, "");
        assert_eq!(t.index, 1);

        let t = parse("frame12").unwrap();
        assert_eq!(t.extension, "");
        assert_eq!(t.index, 12);

        // A hidden file's leading dot is not an extension separator.
        let t = parse(".cache5").unwrap();
        assert_eq!(t.prefix, ".cache");
    }

    #[test]
    fn test_non_ascii_prefix() {
        let t = parse("kuvaä_09.png").unwrap();
        assert_eq!(t.prefix, "kuvaä_");
        assert_eq!(t.index, 9);
    }

    #[test]
    fn test_index_overflow_is_not_a_frame() {
        assert!(parse("f99999999999999999999999.png").is_none());
    }

    #[test]
    fn test_escape_pattern_literal() {
        assert_eq!(escape_pattern_literal("100%_"), "100%%_");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn test_parse_recovers_components(
            prefix in "[a-zA-Z_ -]{0,12}[a-zA-Z_-]",
            index in 0u64..1_000_000,
            extra_padding in 0usize..4,
            ext in prop_oneof![Just("png"), Just("jpg"), Just("tif"), Just("dpx")],
        ) {
            let digits = index.to_string();
            let width = digits.len() + extra_padding;
            let name = format!("{}{:0width$}.{}", prefix, index, ext, width = width);
            let token = parse(&name).unwrap();

            prop_assert_eq!(&token.prefix, &prefix);
            prop_assert_eq!(token.index, index);
            prop_assert_eq!(token.padding_width, width);
            prop_assert_eq!(token.extension.as_str(), ext);
        }
    }
}
