use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rerun_contracts::{
    OUTPUT_DIR, RUN_MARKER_FILE, SCAFFOLD_PACKAGE, SIDE_CHANNEL_LOG_FILE, SOURCE_DIR,
};

/// The per-run configuration the instrumented scaffolding reads at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMarker {
    pub prev_run_number: u32,
}

impl RunMarker {
    /// The scaffolding logs run `prevRunNumber + 1`, so replaying run `n`
    /// means starting from `n - 1`.
    pub fn for_run(run_number: u32) -> Self {
        Self {
            prev_run_number: run_number.saturating_sub(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayMode {
    /// Support classes copied from the overlay source.
    Full,
    /// Run marker only; the logging hook will not be present.
    Minimal,
}

fn default_marker_body() -> serde_json::Value {
    serde_json::json!({
        "prevRunNumber": 0,
        "redactDiffs": false,
        "rebaselining": false,
        "skipLogging": false,
        "prevBaselineRunNumber": 0,
    })
}

/// A `{src, bin}` directory pair reused across runs.
///
/// The scaffolding package under `src/` survives every source clear; everything
/// else under `src/` and all of `bin/` is wiped before each run.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let root = std::path::absolute(&root)
            .with_context(|| format!("absolute path: {}", root.display()))?;
        for dir in [root.join(SOURCE_DIR), root.join(OUTPUT_DIR)] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create dir: {}", dir.display()))?;
        }
        debug!(root = %root.display(), "workspace created");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn src_dir(&self) -> PathBuf {
        self.root.join(SOURCE_DIR)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    pub fn scaffold_dir(&self) -> PathBuf {
        self.src_dir().join(SCAFFOLD_PACKAGE)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.scaffold_dir().join(RUN_MARKER_FILE)
    }

    pub fn side_channel_log_path(&self) -> PathBuf {
        self.scaffold_dir().join(SIDE_CHANNEL_LOG_FILE)
    }

    pub fn clear_source_preserving_overlay(&self) -> Result<()> {
        clear_dir_except(&self.src_dir(), Some(SCAFFOLD_PACKAGE))
    }

    pub fn clear_compiled_output(&self) -> Result<()> {
        clear_dir_except(&self.bin_dir(), None)
    }

    /// Replaces the scaffolding package with a copy of `source`.
    ///
    /// A missing source degrades to a synthetic scaffolding holding only the run
    /// marker. Either way the marker exists afterwards.
    pub fn install_overlay(&self, source: Option<&Path>) -> Result<OverlayMode> {
        let dst = self.scaffold_dir();
        if dst.exists() {
            std::fs::remove_dir_all(&dst)
                .with_context(|| format!("remove dir: {}", dst.display()))?;
        }
        std::fs::create_dir_all(&dst).with_context(|| format!("create dir: {}", dst.display()))?;

        let mode = match source {
            Some(src) if src.is_dir() => {
                copy_dir_contents(src, &dst)?;
                OverlayMode::Full
            }
            _ => OverlayMode::Minimal,
        };

        let marker = self.marker_path();
        if !marker.is_file() {
            write_json(&marker, &default_marker_body())?;
        }
        info!(mode = ?mode, dir = %dst.display(), "scaffolding installed");
        Ok(mode)
    }

    /// Rewrites the run marker, keeping every other key already in the file.
    pub fn write_run_marker(&self, marker: &RunMarker) -> Result<()> {
        let path = self.marker_path();
        let mut body = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .filter(|v| v.is_object())
                .unwrap_or_else(default_marker_body),
            Err(_) => default_marker_body(),
        };
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                "prevRunNumber".to_string(),
                serde_json::Value::from(marker.prev_run_number),
            );
        }
        write_json(&path, &body)
    }

    pub fn read_run_marker(&self) -> Result<RunMarker> {
        let path = self.marker_path();
        let bytes = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
    }

    pub fn remove(self) -> Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)
                .with_context(|| format!("remove dir: {}", self.root.display()))?;
        }
        Ok(())
    }
}

fn write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir: {}", parent.display()))?;
    }
    let mut bytes = serde_json::to_vec_pretty(value).context("serialize json")?;
    bytes.push(b'\n');
    std::fs::write(path, bytes).with_context(|| format!("write {}", path.display()))
}

fn clear_dir_except(dir: &Path, keep: Option<&str>) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).with_context(|| format!("create dir: {}", dir.display()))?;
        return Ok(());
    }
    for entry in std::fs::read_dir(dir).with_context(|| format!("read_dir: {}", dir.display()))? {
        let entry = entry.context("read_dir entry")?;
        if keep.is_some_and(|k| entry.file_name().to_str() == Some(k)) {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type().context("file_type")?;
        if file_type.is_dir() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("remove dir: {}", path.display()))?;
        } else {
            std::fs::remove_file(&path)
                .with_context(|| format!("remove file: {}", path.display()))?;
        }
    }
    Ok(())
}

fn copy_dir_contents(src_dir: &Path, dst_dir: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", src_dir.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .with_context(|| format!("strip prefix: {}", entry.path().display()))?;
        let dst = dst_dir.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dst).with_context(|| format!("create dir: {}", dst.display()))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &dst).with_context(|| {
                format!("copy file from {} to {}", entry.path().display(), dst.display())
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_for_first_run_does_not_underflow() {
        assert_eq!(RunMarker::for_run(0).prev_run_number, 0);
        assert_eq!(RunMarker::for_run(1).prev_run_number, 0);
        assert_eq!(RunMarker::for_run(12).prev_run_number, 11);
    }
}
