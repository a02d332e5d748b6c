use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use rerun_archive::{ArchiveEntryCache, ArchiveError, PatchPointer};
use rerun_contracts::{SCAFFOLD_PACKAGE, SOURCE_EXTENSION};
use rerun_patch::{
    decode, join_lines, replay, split_lines, DecodeError, PatchApplyError, PatchBody,
    ReplayError, Unreconstructible,
};

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("decode {entry}")]
    Decode { entry: String, source: DecodeError },
    #[error(transparent)]
    Apply(#[from] PatchApplyError),
    #[error(transparent)]
    Unreconstructible(#[from] Unreconstructible),
    #[error("{entry} is not valid UTF-8")]
    NotUtf8 { entry: String },
    #[error("file key {key:?} does not map to a path inside the source root")]
    UnsafeFileKey { key: String },
    #[error("write {}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ReconstructError {
    fn from_replay(entry: &str, err: ReplayError) -> Self {
        match err {
            ReplayError::Decode(source) => ReconstructError::Decode {
                entry: entry.to_string(),
                source,
            },
            ReplayError::Apply(e) => e.into(),
            ReplayError::Unreconstructible(e) => e.into(),
        }
    }
}

/// Pointers grouped by file key, then run number.
///
/// Loading enforces at most one patch per `(file key, run)`; later duplicates
/// are dropped with a warning.
#[derive(Debug, Clone, Default)]
pub struct PatchSet {
    by_file: BTreeMap<String, BTreeMap<u32, PatchPointer>>,
    warnings: Vec<String>,
}

impl PatchSet {
    pub fn new(pointers: impl IntoIterator<Item = PatchPointer>) -> Self {
        let mut set = PatchSet::default();
        for p in pointers {
            let runs = set.by_file.entry(p.file_key.clone()).or_default();
            if let Some(kept) = runs.get(&p.run_number) {
                set.warnings.push(format!(
                    "duplicate patch for {} at run {} ({} in {}); keeping {} in {}",
                    p.file_key,
                    p.run_number,
                    p.patch_entry,
                    p.archive_filename,
                    kept.patch_entry,
                    kept.archive_filename
                ));
                continue;
            }
            runs.insert(p.run_number, p);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.by_file.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_file.values().map(BTreeMap::len).sum()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn available_runs(&self) -> Vec<u32> {
        let runs: BTreeSet<u32> = self
            .by_file
            .values()
            .flat_map(|runs| runs.keys().copied())
            .collect();
        runs.into_iter().collect()
    }

    pub fn file_keys(&self) -> Vec<&str> {
        self.by_file.keys().map(String::as_str).collect()
    }

    pub fn nearest_run_at_or_before(&self, target: u32) -> Option<u32> {
        self.available_runs()
            .into_iter()
            .filter(|r| *r <= target)
            .next_back()
    }

    /// Pointers whose run is exactly `run`, ordered by file key.
    pub fn select_exact(&self, run: u32) -> Vec<&PatchPointer> {
        self.by_file
            .values()
            .filter_map(|runs| runs.get(&run))
            .collect()
    }

    /// For every file key, the pointer with the greatest run `<= target`.
    /// Keys with no such pointer did not exist yet at `target`.
    pub fn select_latest_at_or_before(&self, target: u32) -> Vec<&PatchPointer> {
        self.by_file
            .values()
            .filter_map(|runs| runs.range(..=target).next_back().map(|(_, p)| p))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    ExactRun,
    LatestAtOrBefore,
}

/// Maps a logged file key onto a path relative to the source root.
///
/// `dir/Foo.java.Foo` -> `dir/Foo.java`, `Foo.java` stays as is,
/// `a.b.Foo` -> `a/b/Foo.java`, `Foo` -> `Foo.java`. Keys that would leave the
/// source root map to `None`.
pub fn file_key_to_relative_path(key: &str) -> Option<PathBuf> {
    let marker = format!("{SOURCE_EXTENSION}.");
    let rel = if let Some(idx) = key.find(&marker) {
        PathBuf::from(&key[..idx + SOURCE_EXTENSION.len()])
    } else if key.ends_with(SOURCE_EXTENSION) {
        PathBuf::from(key)
    } else {
        let mut parts: Vec<&str> = key.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        let class = parts.pop()?;
        let mut path: PathBuf = parts.into_iter().collect();
        path.push(format!("{class}{SOURCE_EXTENSION}"));
        path
    };
    let safe = rel.components().count() > 0
        && rel
            .components()
            .all(|c| matches!(c, Component::Normal(s) if !s.is_empty()));
    safe.then_some(rel)
}

fn in_scaffold(rel: &Path) -> bool {
    rel.components()
        .next()
        .is_some_and(|c| c.as_os_str() == SCAFFOLD_PACKAGE)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    pub files_written: usize,
    /// Relative to the source root, in write order.
    pub written: Vec<PathBuf>,
    pub failures: Vec<String>,
    pub warnings: Vec<String>,
}

/// Rebuilds source trees from a baseline plus one patch per file.
pub struct SnapshotMaterializer<'a> {
    archives_dir: PathBuf,
    cache: &'a ArchiveEntryCache,
}

impl<'a> SnapshotMaterializer<'a> {
    pub fn new(archives_dir: impl Into<PathBuf>, cache: &'a ArchiveEntryCache) -> Self {
        Self {
            archives_dir: archives_dir.into(),
            cache,
        }
    }

    /// The file's lines as of the pointer's run.
    pub fn reconstruct(&self, pointer: &PatchPointer) -> Result<Vec<String>, ReconstructError> {
        let archive = self.archives_dir.join(&pointer.archive_filename);
        let patch_bytes = self.cache.read(&archive, &pointer.patch_entry)?;
        let body = decode(&patch_bytes).map_err(|source| ReconstructError::Decode {
            entry: pointer.patch_entry.clone(),
            source,
        })?;
        if body == PatchBody::TooLarge {
            return Err(Unreconstructible.into());
        }
        let baseline = self.cache.read(&archive, &pointer.baseline_entry)?;
        let baseline = String::from_utf8(baseline).map_err(|_| ReconstructError::NotUtf8 {
            entry: pointer.baseline_entry.clone(),
        })?;
        replay(&split_lines(&baseline), &body)
            .map_err(|e| ReconstructError::from_replay(&pointer.patch_entry, e))
    }

    fn write_one(&self, pointer: &PatchPointer, src_dir: &Path) -> Result<PathBuf, ReconstructError> {
        let rel = file_key_to_relative_path(&pointer.file_key).ok_or_else(|| {
            ReconstructError::UnsafeFileKey {
                key: pointer.file_key.clone(),
            }
        })?;
        let lines = self.reconstruct(pointer)?;
        let dest = src_dir.join(&rel);
        let write_err = |source: std::io::Error| ReconstructError::Write {
            path: dest.clone(),
            source,
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(&dest, join_lines(&lines)).map_err(write_err)?;
        Ok(rel)
    }

    /// Writes the selected snapshot of every file under `src_dir`.
    ///
    /// A file that cannot be rebuilt is skipped with a warning; the caller
    /// treats zero files written as an unprocessable run.
    pub fn materialize(
        &self,
        patches: &PatchSet,
        run: u32,
        mode: SelectionMode,
        src_dir: &Path,
    ) -> MaterializeReport {
        let mut report = MaterializeReport::default();
        let selected = match mode {
            SelectionMode::ExactRun => patches.select_exact(run),
            SelectionMode::LatestAtOrBefore => patches.select_latest_at_or_before(run),
        };
        if selected.is_empty() {
            let msg = match mode {
                SelectionMode::ExactRun => format!("No patches found for run {run}"),
                SelectionMode::LatestAtOrBefore => {
                    format!("No patches found at or before run {run}")
                }
            };
            warn!(run, "{msg}");
            report.warnings.push(msg);
            return report;
        }

        for pointer in selected {
            if let Some(rel) = file_key_to_relative_path(&pointer.file_key) {
                if in_scaffold(&rel) {
                    let msg = format!(
                        "Skipping {}: path lies inside the {SCAFFOLD_PACKAGE} overlay",
                        pointer.file_key
                    );
                    warn!(file_key = %pointer.file_key, "{msg}");
                    report.warnings.push(msg);
                    continue;
                }
            }
            match self.write_one(pointer, src_dir) {
                Ok(rel) => {
                    debug!(file_key = %pointer.file_key, from_run = pointer.run_number, "reconstructed");
                    report.files_written += 1;
                    report.written.push(rel);
                }
                Err(e @ ReconstructError::Unreconstructible(_)) => {
                    let msg = format!(
                        "Skipping {}: {:#}",
                        pointer.file_key,
                        anyhow::Error::new(e)
                    );
                    warn!(file_key = %pointer.file_key, "{msg}");
                    report.failures.push(pointer.file_key.clone());
                    report.warnings.push(msg);
                }
                Err(e) => {
                    let msg = format!(
                        "Failed to reconstruct {}: {:#}",
                        pointer.file_key,
                        anyhow::Error::new(e)
                    );
                    warn!(file_key = %pointer.file_key, "{msg}");
                    report.failures.push(pointer.file_key.clone());
                    report.warnings.push(msg);
                }
            }
        }
        info!(
            run,
            files = report.files_written,
            failures = report.failures.len(),
            "snapshot materialized"
        );
        report
    }
}
