//! Read access to diff archives: a zip container holding a single tar stream of
//! `baselines/<fileKey>` and `patches/<fileKey>_<run>` entries.
//!
//! Nothing here expands an archive to disk. The index walks entry headers once;
//! the cache pulls single entries out on demand and keeps them forever, keyed by
//! the archive's content hash.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

mod cache;
mod container;
mod index;

pub use cache::ArchiveEntryCache;
pub use container::write_diff_archive;
pub use index::{
    index_all, index_dir, is_diff_archive_filename, parse_baseline_run_number,
    parse_patch_entry_name, read_patch_index, write_index, DiffArchiveSummary, DiffIndex,
    DiffIndexDocument, PatchPointer,
};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}: container holds no inner archive", path.display())]
    EmptyContainer { path: PathBuf },
    #[error("{}: unreadable container", path.display())]
    Container {
        path: PathBuf,
        source: zip::result::ZipError,
    },
    #[error("{}: corrupt inner archive", path.display())]
    Corrupt {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}: entry {entry:?} not found", archive.display())]
    EntryNotFound { archive: PathBuf, entry: String },
}

impl ArchiveError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0F) as usize] as char);
    }
    out
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex_lower(&Sha256::digest(bytes))
}

/// Streams a file through SHA-256.
pub fn sha256_file(path: &Path) -> Result<String, ArchiveError> {
    let mut f = std::fs::File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).map_err(|e| ArchiveError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_lower(&hasher.finalize()))
}
