use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};

use rerun_contracts::DIFF_ARCHIVE_INNER_ENTRY;

use crate::ArchiveError;

fn open_container(path: &Path) -> Result<zip::ZipArchive<BufReader<File>>, ArchiveError> {
    let f = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    zip::ZipArchive::new(BufReader::new(f)).map_err(|source| ArchiveError::Container {
        path: path.to_path_buf(),
        source,
    })
}

/// Prefers the conventionally named inner stream, else the first file entry.
fn inner_stream_index(
    zip: &mut zip::ZipArchive<BufReader<File>>,
    path: &Path,
) -> Result<usize, ArchiveError> {
    let mut first_file = None;
    for i in 0..zip.len() {
        let file = zip.by_index(i).map_err(|source| ArchiveError::Container {
            path: path.to_path_buf(),
            source,
        })?;
        if file.is_dir() {
            continue;
        }
        if file.name() == DIFF_ARCHIVE_INNER_ENTRY {
            return Ok(i);
        }
        first_file.get_or_insert(i);
    }
    first_file.ok_or_else(|| ArchiveError::EmptyContainer {
        path: path.to_path_buf(),
    })
}

/// Visits every regular entry of the inner tar stream in stored order.
///
/// `visit` returns `true` to stop early. Entry bodies the visitor does not read
/// are skipped without being buffered.
pub(crate) fn scan_entries<F>(path: &Path, mut visit: F) -> Result<(), ArchiveError>
where
    F: FnMut(&str, &mut dyn Read) -> Result<bool, ArchiveError>,
{
    let mut zip = open_container(path)?;
    let idx = inner_stream_index(&mut zip, path)?;
    let inner = zip.by_index(idx).map_err(|source| ArchiveError::Container {
        path: path.to_path_buf(),
        source,
    })?;

    let corrupt = |source: std::io::Error| ArchiveError::Corrupt {
        path: path.to_path_buf(),
        source,
    };
    let mut tar = tar::Archive::new(inner);
    for entry in tar.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let name = raw.strip_prefix("./").unwrap_or(&raw);
        if visit(name, &mut entry)? {
            break;
        }
    }
    Ok(())
}

/// Reads one named entry's bytes out of the inner stream.
pub(crate) fn extract_entry(path: &Path, wanted: &str) -> Result<Vec<u8>, ArchiveError> {
    let mut found = None;
    scan_entries(path, |name, body| {
        if name != wanted {
            return Ok(false);
        }
        let mut buf = Vec::new();
        body.read_to_end(&mut buf)
            .map_err(|source| ArchiveError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;
        found = Some(buf);
        Ok(true)
    })?;
    found.ok_or_else(|| ArchiveError::EntryNotFound {
        archive: path.to_path_buf(),
        entry: wanted.to_string(),
    })
}

/// Writes a diff archive in the logger's layout: a zip whose single `diffs` entry
/// is a tar of `entries`. Entries are stored sorted with zeroed metadata so the
/// same input always yields the same tar stream.
pub fn write_diff_archive(path: &Path, entries: &[(String, Vec<u8>)]) -> Result<()> {
    let mut sorted: Vec<&(String, Vec<u8>)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        builder.mode(tar::HeaderMode::Deterministic);
        for (name, bytes) in sorted {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_cksum();
            builder
                .append_data(&mut header, name, std::io::Cursor::new(bytes))
                .with_context(|| format!("append tar entry: {name}"))?;
        }
        builder.finish().context("finish tar")?;
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir: {}", parent.display()))?;
    }
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut zip = zip::ZipWriter::new(f);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    zip.start_file(DIFF_ARCHIVE_INNER_ENTRY, options)
        .context("start zip entry")?;
    zip.write_all(&tar_bytes).context("write zip entry")?;
    zip.finish().context("finish zip")?;
    Ok(())
}
