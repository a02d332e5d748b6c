use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::container::extract_entry;
use crate::{sha256_file, sha256_hex, ArchiveError};

/// Write-once cache of single entries pulled out of diff archives.
///
/// Entries live at `<dir>/<sha256(archiveSha256 ":" entryName)>.bin` and are
/// never invalidated: archives are immutable and the key covers their content.
/// The handle is single-writer (`!Sync`); the directory takes no locks.
#[derive(Debug)]
pub struct ArchiveEntryCache {
    dir: PathBuf,
    archive_hashes: RefCell<BTreeMap<PathBuf, String>>,
    extractions: Cell<u64>,
}

impl ArchiveEntryCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            archive_hashes: RefCell::new(BTreeMap::new()),
            extractions: Cell::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of times an archive was actually opened and scanned.
    pub fn extractions(&self) -> u64 {
        self.extractions.get()
    }

    pub fn entry_path(&self, archive_sha256: &str, entry: &str) -> PathBuf {
        let key = sha256_hex(format!("{archive_sha256}:{entry}").as_bytes());
        self.dir.join(format!("{key}.bin"))
    }

    /// Content hash of `archive`, computed once per path for this handle.
    pub fn archive_sha256(&self, archive: &Path) -> Result<String, ArchiveError> {
        if let Some(h) = self.archive_hashes.borrow().get(archive) {
            return Ok(h.clone());
        }
        let h = sha256_file(archive)?;
        self.archive_hashes
            .borrow_mut()
            .insert(archive.to_path_buf(), h.clone());
        Ok(h)
    }

    /// Returns the cache path holding `entry` of `archive`, extracting it first
    /// if this is the first request.
    pub fn materialize(&self, archive: &Path, entry: &str) -> Result<PathBuf, ArchiveError> {
        let sha = self.archive_sha256(archive)?;
        let path = self.entry_path(&sha, entry);
        if path.is_file() {
            debug!(archive = %archive.display(), entry, "entry cache hit");
            return Ok(path);
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| ArchiveError::io(&self.dir, e))?;
        self.extractions.set(self.extractions.get() + 1);
        let bytes = extract_entry(archive, entry)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = self
            .dir
            .join(format!(".{file_name}.{}.tmp", std::process::id()));
        std::fs::write(&tmp, &bytes).map_err(|e| ArchiveError::io(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(ArchiveError::io(&path, e));
        }
        debug!(
            archive = %archive.display(),
            entry,
            bytes = bytes.len(),
            "entry extracted"
        );
        Ok(path)
    }

    pub fn read(&self, archive: &Path, entry: &str) -> Result<Vec<u8>, ArchiveError> {
        let path = self.materialize(archive, entry)?;
        std::fs::read(&path).map_err(|e| ArchiveError::io(&path, e))
    }
}
