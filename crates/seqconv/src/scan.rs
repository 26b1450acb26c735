use std::path::{Path, PathBuf};
use log::trace;
use walkdir::WalkDir;
use crate::error::ScanError;

/// Regular files directly inside one directory, sorted by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryListing {
    pub directory: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Depth-first, pre-order walk yielding one listing per directory.
///
/// Entries are sorted by file name at every level, so the order is the same
/// on every run. A directory that cannot be listed yields an error and is not
/// descended into; the walk carries on with its siblings.
#[derive(Debug)]
pub struct DirectoryWalk {
    pending: Vec<PathBuf>,
    recursive: bool,
}

impl DirectoryWalk {
    pub fn new(root: &Path, recursive: bool) -> Self {
        DirectoryWalk {
            pending: vec![root.to_path_buf()],
            recursive,
        }
    }
}

impl Iterator for DirectoryWalk {
    type Item = Result<DirectoryListing, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        let directory = self.pending.pop()?;

        match list_directory(&directory) {
            Ok((files, subdirs)) => {
                if self.recursive {
                    // Stack: push in reverse so the lowest name is visited first.
                    self.pending.extend(subdirs.into_iter().rev());
                }
                Some(Ok(DirectoryListing { directory, files }))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Files and subdirectories of `directory`, both sorted by name.
///
/// Symlinked directories are not followed; symlinks to files are listed.
pub fn list_directory(directory: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), ScanError> {
    let mut files = Vec::new();
    let mut subdirs = Vec::new();

    let walker = WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| ScanError::from_walkdir(directory.to_path_buf(), e))?;
        let path = entry.path();

        if entry.file_type().is_dir() {
            subdirs.push(path.to_path_buf());
        } else if path.is_file() {
            files.push(path.to_path_buf());
        } else {
            trace!("Skipping non-regular entry: {}", path.display());
        }
    }

    Ok((files, subdirs))
}
