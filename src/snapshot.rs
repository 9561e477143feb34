//! Filesystem metadata snapshots taken before and after a job run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::debug;
use walkdir::WalkDir;

/// Metadata recorded for one regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub modified: SystemTime,
    pub size: u64,
}

/// Path to metadata map for every regular file under `root`.
///
/// Two snapshots are compared structurally; a snapshot is never mutated once
/// captured.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileSnapshot {
    root: PathBuf,
    files: BTreeMap<PathBuf, FileMeta>,
}

impl FileSnapshot {
    /// Walks `root` recursively and records every regular file.
    ///
    /// Entries that cannot be read (permission errors, files removed mid-walk)
    /// are skipped. A missing root yields an empty snapshot.
    pub fn capture(root: &Path) -> Self {
        let mut files = BTreeMap::new();
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            files.insert(
                entry.into_path(),
                FileMeta {
                    modified,
                    size: metadata.len(),
                },
            );
        }
        debug!("Captured {} files under {}", files.len(), root.display());
        Self {
            root: root.to_path_buf(),
            files,
        }
    }

    /// Builds a snapshot from already known entries.
    pub fn from_entries<I, P>(root: impl Into<PathBuf>, entries: I) -> Self
    where
        I: IntoIterator<Item = (P, FileMeta)>,
        P: Into<PathBuf>,
    {
        Self {
            root: root.into(),
            files: entries
                .into_iter()
                .map(|(path, meta)| (path.into(), meta))
                .collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, path: &Path) -> Option<&FileMeta> {
        self.files.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &FileMeta)> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
