use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use serde::Serialize;
use crate::pattern::{self, FrameToken};

/// Tokens with equal keys are candidates for the same sequence.
///
/// The extension is kept as spelled so the input pattern matches every frame
/// of the sequence on a case-sensitive file system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SequenceKey {
    prefix: String,
    suffix: String,
    extension: String,
    padding_width: usize,
}

impl SequenceKey {
    fn of(token: &FrameToken) -> Self {
        SequenceKey {
            prefix: token.prefix.clone(),
            suffix: token.suffix.clone(),
            extension: token.extension.clone(),
            padding_width: token.padding_width,
        }
    }

    /// Keys differing only in extension case name the same frames, e.g.
    /// `a_01.png` and `a_01.PNG`.
    fn case_folded(&self) -> Self {
        SequenceKey {
            extension: self.extension.to_ascii_lowercase(),
            ..self.clone()
        }
    }
}

/// Two or more frames in one directory sharing a naming pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sequence {
    pub prefix: String,
    pub suffix: String,
    pub extension: String,
    pub padding_width: usize,
    /// Sorted ascending by index, no duplicate indices, at least two entries.
    pub frames: Vec<FrameToken>,
    pub directory: PathBuf,
}

impl Sequence {
    pub fn first_index(&self) -> u64 {
        self.frames[0].index
    }

    pub fn last_index(&self) -> u64 {
        self.frames[self.frames.len() - 1].index
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Number of indices between first and last that have no file.
    pub fn gap_count(&self) -> u64 {
        // Saturating: 20-digit indices span the whole u64 range.
        (self.last_index() - self.first_index()).saturating_sub(self.frames.len() as u64 - 1)
    }

    pub fn is_contiguous(&self) -> bool {
        self.gap_count() == 0
    }

    /// Inclusive ranges of missing indices.
    pub fn missing_ranges(&self) -> Vec<(u64, u64)> {
        self.frames
            .windows(2)
            .filter(|w| w[1].index > w[0].index + 1)
            .map(|w| (w[0].index + 1, w[1].index - 1))
            .collect()
    }

    /// image2 input pattern relative to the sequence directory, e.g. `shot_%04d.png`.
    pub fn input_pattern(&self) -> String {
        let mut out = pattern::escape_pattern_literal(&self.prefix);
        out.push_str(&format!("%0{}d", self.padding_width));
        out.push_str(&pattern::escape_pattern_literal(&self.suffix));
        if !self.extension.is_empty() {
            out.push('.');
            out.push_str(&self.extension);
        }
        out
    }

    /// Zero-padded rendering of an index at this sequence's width.
    pub fn format_index(&self, index: u64) -> String {
        format!("{:0width$}", index, width = self.padding_width)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{} [{}-{}, {} frames]",
            self.prefix,
            "#".repeat(self.padding_width),
            self.suffix,
            if self.extension.is_empty() { String::new() } else { format!(".{}", self.extension) },
            self.first_index(),
            self.last_index(),
            self.frame_count(),
        )
    }
}

/// Two files mapping to the same frame of one sequence; only `kept` is encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateFrame {
    pub index: u64,
    pub kept: PathBuf,
    pub dropped: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct Grouping {
    /// In first-appearance order of each naming pattern.
    pub sequences: Vec<Sequence>,
    pub duplicates: Vec<DuplicateFrame>,
}

/// Parse and group the files of one directory.
pub fn group_files<'a, I>(directory: &Path, files: I) -> Grouping
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    group_tokens(directory, files.into_iter().filter_map(|p| pattern::parse_frame(p)))
}

/// Partition tokens of one directory into sequences.
///
/// Groups of a single distinct frame are ordinary files and are dropped
/// silently. When groups differ only in extension case, each index goes to
/// the file with the lowest name and the others are reported as duplicates.
pub fn group_tokens<I>(directory: &Path, tokens: I) -> Grouping
where
    I: IntoIterator<Item = FrameToken>,
{
    let mut order: Vec<(SequenceKey, Vec<FrameToken>)> = Vec::new();
    let mut positions: HashMap<SequenceKey, usize> = HashMap::new();

    for token in tokens {
        let key = SequenceKey::of(&token);
        match positions.get(&key) {
            Some(&pos) => order[pos].1.push(token),
            None => {
                positions.insert(key.clone(), order.len());
                order.push((key, vec![token]));
            }
        }
    }

    let mut grouping = Grouping::default();

    for (_, frames) in order.iter_mut() {
        frames.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.file_name().cmp(b.file_name())));

        let mut kept: Vec<FrameToken> = Vec::with_capacity(frames.len());
        for frame in frames.drain(..) {
            match kept.last() {
                Some(prev) if prev.index == frame.index => {
                    grouping.duplicates.push(DuplicateFrame {
                        index: frame.index,
                        kept: prev.source_path.clone(),
                        dropped: frame.source_path,
                    });
                }
                _ => kept.push(frame),
            }
        }
        *frames = kept;
    }

    let mut families: Vec<(SequenceKey, Vec<usize>)> = Vec::new();
    for (pos, (key, _)) in order.iter().enumerate() {
        let folded = key.case_folded();
        match families.iter_mut().find(|(k, _)| *k == folded) {
            Some((_, members)) => members.push(pos),
            None => families.push((folded, vec![pos])),
        }
    }

    for (_, mut members) in families {
        if members.len() < 2 {
            continue;
        }
        // Case variants share every byte of the name but the extension, so
        // the lowest extension spelling is the lowest file name.
        members.sort_by(|a, b| order[*a].0.extension.cmp(&order[*b].0.extension));

        let mut claimed: HashMap<u64, PathBuf> = HashMap::new();
        for pos in members {
            order[pos].1.retain(|frame| match claimed.get(&frame.index) {
                Some(kept) => {
                    grouping.duplicates.push(DuplicateFrame {
                        index: frame.index,
                        kept: kept.clone(),
                        dropped: frame.source_path.clone(),
                    });
                    false
                }
                None => {
                    claimed.insert(frame.index, frame.source_path.clone());
                    true
                }
            });
        }
    }

    for (key, frames) in order {
        if frames.len() < 2 {
            continue;
        }
        grouping.sequences.push(Sequence {
            prefix: key.prefix,
            suffix: key.suffix,
            extension: key.extension,
            padding_width: key.padding_width,
            frames,
            directory: directory.to_path_buf(),
        });
    }

    grouping
}
