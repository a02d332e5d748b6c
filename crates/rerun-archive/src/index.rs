use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rerun_contracts::{
    BASELINES_PREFIX, DIFF_ARCHIVE_PREFIX, DIFF_ARCHIVE_SUFFIX, DIFF_INDEX_FILE,
    DIFF_INDEX_SCHEMA_VERSION, PATCHES_INDEX_FILE, PATCHES_PREFIX,
};
use rerun_patch::PatchKind;

use crate::container::scan_entries;
use crate::{sha256_file, ArchiveError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffArchiveSummary {
    pub filename: String,
    /// Parsed from the filename; diagnostic only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_run_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub baseline_count: u64,
    pub patch_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_patch_run_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_patch_run_number: Option<u32>,
}

/// Locates one file's patch for one run inside a diff archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchPointer {
    pub archive_filename: String,
    pub file_key: String,
    pub run_number: u32,
    pub baseline_entry: String,
    pub patch_entry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_kind: Option<PatchKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffIndexDocument {
    pub schema_version: u32,
    pub archives: Vec<DiffArchiveSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffIndex {
    pub archives: Vec<DiffArchiveSummary>,
    pub pointers: Vec<PatchPointer>,
    pub warnings: Vec<String>,
}

pub fn is_diff_archive_filename(name: &str) -> bool {
    name.starts_with(DIFF_ARCHIVE_PREFIX) && name.ends_with(DIFF_ARCHIVE_SUFFIX)
}

/// `diffs_<N>_.tar.zip` -> `N`.
pub fn parse_baseline_run_number(filename: &str) -> Option<u32> {
    let rest = filename
        .strip_prefix(DIFF_ARCHIVE_PREFIX)?
        .strip_suffix(DIFF_ARCHIVE_SUFFIX)?;
    rest.trim_matches('_').parse().ok()
}

/// `patches/<fileKey>_<run>` -> `(fileKey, run)`, splitting on the last underscore
/// so file keys may themselves contain underscores.
pub fn parse_patch_entry_name(entry: &str) -> Option<(String, u32)> {
    let rest = entry.strip_prefix(PATCHES_PREFIX)?;
    let (key, run) = rest.rsplit_once('_')?;
    if key.is_empty() {
        return None;
    }
    let run = run.parse().ok()?;
    Some((key.to_string(), run))
}

struct Scanned {
    baselines: BTreeSet<String>,
    patches: Vec<(String, u32, String)>,
    unparsed: Vec<String>,
}

fn scan_archive(path: &Path) -> Result<Scanned, ArchiveError> {
    let mut out = Scanned {
        baselines: BTreeSet::new(),
        patches: Vec::new(),
        unparsed: Vec::new(),
    };
    scan_entries(path, |name, _body| {
        if let Some(key) = name.strip_prefix(BASELINES_PREFIX) {
            out.baselines.insert(key.to_string());
        } else if name.starts_with(PATCHES_PREFIX) {
            match parse_patch_entry_name(name) {
                Some((key, run)) => out.patches.push((key, run, name.to_string())),
                None => out.unparsed.push(name.to_string()),
            }
        }
        Ok(false)
    })?;
    Ok(out)
}

fn index_one(path: &Path, warnings: &mut Vec<String>) -> (DiffArchiveSummary, Vec<PatchPointer>) {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mut summary = DiffArchiveSummary {
        baseline_run_number: parse_baseline_run_number(&filename),
        filename: filename.clone(),
        sha256: None,
        baseline_count: 0,
        patch_count: 0,
        min_patch_run_number: None,
        max_patch_run_number: None,
    };

    match sha256_file(path) {
        Ok(h) => summary.sha256 = Some(h),
        Err(err) => warnings.push(format!(
            "cannot hash archive {filename}: {:#}",
            anyhow::Error::new(err)
        )),
    }

    let scanned = match scan_archive(path) {
        Ok(s) => s,
        Err(err) => {
            warn!(archive = %filename, error = %err, "archive unreadable; indexed as empty");
            warnings.push(format!(
                "archive {filename} unreadable, indexed as empty: {:#}",
                anyhow::Error::new(err)
            ));
            return (summary, Vec::new());
        }
    };

    for name in &scanned.unparsed {
        warnings.push(format!(
            "{filename}: cannot parse patch entry name {name:?}; entry skipped"
        ));
    }

    let mut pointers = Vec::with_capacity(scanned.patches.len());
    for (file_key, run_number, patch_entry) in scanned.patches {
        if !scanned.baselines.contains(&file_key) {
            warnings.push(format!(
                "{filename}: patch {patch_entry:?} has no baseline entry"
            ));
        }
        pointers.push(PatchPointer {
            archive_filename: filename.clone(),
            baseline_entry: format!("{BASELINES_PREFIX}{file_key}"),
            file_key,
            run_number,
            patch_entry,
            patch_kind: None,
        });
    }

    summary.baseline_count = scanned.baselines.len() as u64;
    summary.patch_count = (pointers.len() + scanned.unparsed.len()) as u64;
    summary.min_patch_run_number = pointers.iter().map(|p| p.run_number).min();
    summary.max_patch_run_number = pointers.iter().map(|p| p.run_number).max();
    info!(
        archive = %filename,
        baselines = summary.baseline_count,
        patches = summary.patch_count,
        "archive indexed"
    );
    (summary, pointers)
}

/// Indexes every archive once, in a deterministic order.
///
/// A corrupt archive degrades to a zero-count summary plus a warning. A second
/// pointer for a `(fileKey, run)` pair already seen, in this archive or an
/// earlier one, is dropped with a warning.
pub fn index_all(archives: &[PathBuf]) -> DiffIndex {
    let mut out = DiffIndex::default();
    for path in archives {
        let (summary, pointers) = index_one(path, &mut out.warnings);
        out.archives.push(summary);
        out.pointers.extend(pointers);
    }

    out.archives.sort_by(|a, b| a.filename.cmp(&b.filename));
    out.pointers.sort_by(|a, b| {
        (&a.archive_filename, &a.file_key, a.run_number).cmp(&(
            &b.archive_filename,
            &b.file_key,
            b.run_number,
        ))
    });

    let mut seen: BTreeSet<(String, u32)> = BTreeSet::new();
    let mut kept = Vec::with_capacity(out.pointers.len());
    for p in std::mem::take(&mut out.pointers) {
        if seen.insert((p.file_key.clone(), p.run_number)) {
            kept.push(p);
        } else {
            warn!(file_key = %p.file_key, run = p.run_number, "duplicate patch dropped");
            out.warnings.push(format!(
                "duplicate patch for {} at run {} in {} ({}); keeping the first",
                p.file_key, p.run_number, p.archive_filename, p.patch_entry
            ));
        }
    }
    out.pointers = kept;
    out
}

/// Indexes every `diffs*.tar.zip` directly inside `dir`.
pub fn index_dir(dir: &Path) -> Result<DiffIndex, ArchiveError> {
    let rd = std::fs::read_dir(dir).map_err(|e| ArchiveError::io(dir, e))?;
    let mut archives = Vec::new();
    for entry in rd {
        let entry = entry.map_err(|e| ArchiveError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_diff_archive_filename(&name) && entry.path().is_file() {
            archives.push(entry.path());
        }
    }
    archives.sort();
    Ok(index_all(&archives))
}

/// Writes `diff_index.json` and `patches_index.jsonl` into `out_dir`.
pub fn write_index(index: &DiffIndex, out_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("create dir: {}", out_dir.display()))?;

    let doc = DiffIndexDocument {
        schema_version: DIFF_INDEX_SCHEMA_VERSION,
        archives: index.archives.clone(),
    };
    let mut bytes = serde_json::to_vec_pretty(&doc).context("serialize diff index")?;
    bytes.push(b'\n');
    let path = out_dir.join(DIFF_INDEX_FILE);
    std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;

    let mut lines = Vec::new();
    for p in &index.pointers {
        serde_json::to_writer(&mut lines, p).context("serialize patch pointer")?;
        lines.push(b'\n');
    }
    let path = out_dir.join(PATCHES_INDEX_FILE);
    std::fs::write(&path, lines).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Reads a `patches_index.jsonl` file; blank lines are ignored, anything else
/// must be a pointer.
pub fn read_patch_index(path: &Path) -> Result<Vec<PatchPointer>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut out = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let p: PatchPointer = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: parse patch pointer", path.display(), i + 1))?;
        out.push(p);
    }
    Ok(out)
}
