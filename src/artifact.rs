//! Infers which file a job produced as its output.
//!
//! The job never declares its artifact. Instead the agent diffs a snapshot
//! taken before the run against one taken after it and ranks the changed files
//! with a fixed heuristic. The result is a best guess, not a guarantee.

use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::snapshot::FileSnapshot;

/// Extensions of files treated as model artifacts.
pub const ARTIFACT_EXTENSIONS: &[&str] = &[
    "pth",
    "pt",
    "h5",
    "keras",
    "pkl",
    "pickle",
    "ckpt",
    "pb",
    "onnx",
    "safetensors",
    "joblib",
    "model",
];

/// Lowercase file-name keywords marking a final artifact.
const NAME_KEYWORDS: &[&str] = &["best", "final", "trained"];

/// Lowercase directory-name tokens of conventional output locations.
const DIRECTORY_TOKENS: &[&str] = &["saved_models", "outputs", "checkpoints", "models"];

/// A changed file eligible to be the job's artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactCandidate {
    pub path: PathBuf,
    /// `true` when the file did not exist before the run.
    pub is_new: bool,
    pub size: u64,
}

/// Which ranking rule picked the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionTier {
    OnlyCandidate,
    NameKeyword,
    OutputDirectory,
    LargestFile,
}

impl fmt::Display for SelectionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SelectionTier::OnlyCandidate => "only candidate",
            SelectionTier::NameKeyword => "file name keyword",
            SelectionTier::OutputDirectory => "output directory",
            SelectionTier::LargestFile => "largest file",
        };
        f.write_str(label)
    }
}

pub fn is_artifact_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ARTIFACT_EXTENSIONS.contains(&ext))
}

/// Artifact files in `after` that are new or whose mtime or size changed,
/// ordered by path.
pub fn candidates(before: &FileSnapshot, after: &FileSnapshot) -> Vec<ArtifactCandidate> {
    after
        .iter()
        .filter(|(path, _)| is_artifact_path(path))
        .filter_map(|(path, meta)| match before.get(path) {
            None => Some(ArtifactCandidate {
                path: path.clone(),
                is_new: true,
                size: meta.size,
            }),
            Some(previous) if previous != meta => Some(ArtifactCandidate {
                path: path.clone(),
                is_new: false,
                size: meta.size,
            }),
            Some(_) => None,
        })
        .collect()
}

/// Picks the most likely artifact among `candidates`.
///
/// Rules apply in order and the first one that matches wins. Within a rule the
/// lexically earliest path is taken, so the outcome only depends on the set of
/// candidates.
pub fn rank<'a>(
    candidates: &'a [ArtifactCandidate],
    root: &Path,
) -> Option<(&'a ArtifactCandidate, SelectionTier)> {
    let mut sorted: Vec<&ArtifactCandidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    match sorted.as_slice() {
        [] => return None,
        [only] => return Some((only, SelectionTier::OnlyCandidate)),
        _ => {}
    }

    if let Some(hit) = sorted.iter().find(|c| name_has_keyword(&c.path)) {
        return Some((hit, SelectionTier::NameKeyword));
    }
    if let Some(hit) = sorted.iter().find(|c| in_output_directory(&c.path, root)) {
        return Some((hit, SelectionTier::OutputDirectory));
    }
    sorted
        .into_iter()
        .max_by(|a, b| a.size.cmp(&b.size).then_with(|| b.path.cmp(&a.path)))
        .map(|hit| (hit, SelectionTier::LargestFile))
}

/// Diffs two snapshots of the same tree and returns the inferred artifact.
pub fn select(before: &FileSnapshot, after: &FileSnapshot) -> Option<PathBuf> {
    let found = candidates(before, after);
    for candidate in &found {
        debug!(
            "{} artifact candidate: {}",
            if candidate.is_new { "New" } else { "Modified" },
            candidate.path.display()
        );
    }
    let (hit, tier) = rank(&found, after.root())?;
    info!(
        "Selected artifact {} ({tier}, {} candidates)",
        hit.path.display(),
        found.len()
    );
    Some(hit.path.clone())
}

fn name_has_keyword(path: &Path) -> bool {
    let Some(name) = path.file_name() else {
        return false;
    };
    let name = name.to_string_lossy().to_lowercase();
    NAME_KEYWORDS.iter().any(|keyword| name.contains(keyword))
}

/// Only directories below `root` count; the job folder's own location is
/// ignored.
fn in_output_directory(path: &Path, root: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let Some(parent) = relative.parent() else {
        return false;
    };
    let parent = parent.to_string_lossy().to_lowercase();
    DIRECTORY_TOKENS.iter().any(|token| parent.contains(token))
}
