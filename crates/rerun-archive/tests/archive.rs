use std::io::Write;
use std::path::Path;

use rerun_archive::{
    index_all, index_dir, read_patch_index, write_diff_archive, write_index, ArchiveEntryCache,
    ArchiveError, DiffIndexDocument,
};

fn entries(items: &[(&str, &str)]) -> Vec<(String, Vec<u8>)> {
    items
        .iter()
        .map(|(n, b)| (n.to_string(), b.as_bytes().to_vec()))
        .collect()
}

fn sample_archive(dir: &Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    write_diff_archive(
        &path,
        &entries(&[
            ("baselines/pkg.Foo", "class Foo {}\n"),
            ("baselines/pkg.Bar", "class Bar {}\n"),
            ("patches/pkg.Foo_3", "File created!\n"),
            ("patches/pkg.Foo_7", "0;\n"),
            ("patches/pkg.Bar_5", "1;\nINSERT\n1,1\n0,\n1,\n// x\n"),
        ]),
    )
    .expect("write archive");
    path
}

#[test]
fn cache_extracts_each_entry_once() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let archive = sample_archive(tmp.path(), "diffs_0_.tar.zip");
    let cache = ArchiveEntryCache::new(tmp.path().join("cache"));

    let first = cache.read(&archive, "baselines/pkg.Foo").expect("first read");
    let second = cache.read(&archive, "baselines/pkg.Foo").expect("second read");
    assert_eq!(first, b"class Foo {}\n");
    assert_eq!(first, second);
    assert_eq!(cache.extractions(), 1);

    let path = cache
        .materialize(&archive, "baselines/pkg.Foo")
        .expect("materialize");
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("bin"));
    assert_eq!(cache.extractions(), 1);

    // A fresh handle over the same directory still hits the cache.
    let reopened = ArchiveEntryCache::new(tmp.path().join("cache"));
    assert_eq!(reopened.read(&archive, "baselines/pkg.Foo").unwrap(), first);
    assert_eq!(reopened.extractions(), 0);
}

#[test]
fn missing_entry_is_entry_not_found() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let archive = sample_archive(tmp.path(), "diffs_0_.tar.zip");
    let cache = ArchiveEntryCache::new(tmp.path().join("cache"));

    let err = cache.read(&archive, "patches/pkg.Foo_99").unwrap_err();
    match err {
        ArchiveError::EntryNotFound { entry, .. } => assert_eq!(entry, "patches/pkg.Foo_99"),
        other => panic!("unexpected error: {other}"),
    }
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("cache"))
        .unwrap()
        .collect();
    assert!(leftovers.is_empty(), "no partial cache file may remain");
}

#[test]
fn empty_container_is_an_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("diffs_1_.tar.zip");
    let f = std::fs::File::create(&path).unwrap();
    zip::ZipWriter::new(f).finish().unwrap();

    let cache = ArchiveEntryCache::new(tmp.path().join("cache"));
    let err = cache.read(&path, "baselines/pkg.Foo").unwrap_err();
    assert!(matches!(err, ArchiveError::EmptyContainer { .. }), "{err}");
}

#[test]
fn indexing_is_idempotent() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let archives = tmp.path().join("archives");
    sample_archive(&archives, "diffs_0_.tar.zip");
    write_diff_archive(
        &archives.join("diffs_9_.tar.zip"),
        &entries(&[
            ("baselines/pkg.Baz", "class Baz {}\n"),
            ("patches/pkg.Baz_10", "0;\n"),
        ]),
    )
    .unwrap();
    std::fs::write(archives.join("notes.txt"), "ignored").unwrap();

    let a = index_dir(&archives).expect("index");
    let b = index_dir(&archives).expect("index again");
    assert_eq!(a, b);
    assert!(a.warnings.is_empty(), "{:?}", a.warnings);

    let names: Vec<_> = a.archives.iter().map(|s| s.filename.as_str()).collect();
    assert_eq!(names, ["diffs_0_.tar.zip", "diffs_9_.tar.zip"]);
    let first = &a.archives[0];
    assert_eq!(first.baseline_count, 2);
    assert_eq!(first.patch_count, 3);
    assert_eq!(first.min_patch_run_number, Some(3));
    assert_eq!(first.max_patch_run_number, Some(7));
    assert_eq!(first.baseline_run_number, Some(0));
    assert_eq!(first.sha256.as_deref().map(str::len), Some(64));

    let keys: Vec<_> = a
        .pointers
        .iter()
        .map(|p| (p.file_key.as_str(), p.run_number))
        .collect();
    assert_eq!(
        keys,
        [("pkg.Bar", 5), ("pkg.Foo", 3), ("pkg.Foo", 7), ("pkg.Baz", 10)]
    );
    assert_eq!(a.pointers[0].baseline_entry, "baselines/pkg.Bar");
    assert_eq!(a.pointers[0].patch_entry, "patches/pkg.Bar_5");

    let out1 = tmp.path().join("out1");
    let out2 = tmp.path().join("out2");
    write_index(&a, &out1).unwrap();
    write_index(&b, &out2).unwrap();
    for file in ["diff_index.json", "patches_index.jsonl"] {
        assert_eq!(
            std::fs::read(out1.join(file)).unwrap(),
            std::fs::read(out2.join(file)).unwrap(),
            "{file} differs between passes"
        );
    }

    let doc: DiffIndexDocument =
        serde_json::from_slice(&std::fs::read(out1.join("diff_index.json")).unwrap()).unwrap();
    assert_eq!(doc.schema_version, 1);
    assert_eq!(doc.archives, a.archives);

    let jsonl = std::fs::read_to_string(out1.join("patches_index.jsonl")).unwrap();
    assert!(jsonl.lines().next().unwrap().contains("\"fileKey\":\"pkg.Bar\""));
    assert!(!jsonl.contains("patchKind"));
    assert_eq!(read_patch_index(&out1.join("patches_index.jsonl")).unwrap(), a.pointers);
}

#[test]
fn duplicate_file_run_pairs_are_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let one = sample_archive(tmp.path(), "diffs_0_.tar.zip");
    let two = tmp.path().join("diffs_1_.tar.zip");
    write_diff_archive(
        &two,
        &entries(&[
            ("baselines/pkg.Foo", "class Foo { int x; }\n"),
            ("patches/pkg.Foo_7", "0;\n"),
            ("patches/pkg.Foo_8", "0;\n"),
        ]),
    )
    .unwrap();

    let index = index_all(&[two.clone(), one]);
    let foo_runs: Vec<_> = index
        .pointers
        .iter()
        .filter(|p| p.file_key == "pkg.Foo")
        .map(|p| (p.archive_filename.as_str(), p.run_number))
        .collect();
    assert_eq!(
        foo_runs,
        [
            ("diffs_0_.tar.zip", 3),
            ("diffs_0_.tar.zip", 7),
            ("diffs_1_.tar.zip", 8)
        ]
    );
    assert_eq!(index.warnings.len(), 1);
    assert!(index.warnings[0].contains("duplicate patch for pkg.Foo at run 7"));
}

#[test]
fn corrupt_archive_indexes_as_empty() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let good = sample_archive(tmp.path(), "diffs_0_.tar.zip");
    let bad = tmp.path().join("diffs_5_.tar.zip");
    let mut f = std::fs::File::create(&bad).unwrap();
    f.write_all(b"PK\x03\x04 definitely not a zip").unwrap();

    let index = index_all(&[bad, good]);
    assert_eq!(index.archives.len(), 2);
    let broken = &index.archives[1];
    assert_eq!(broken.filename, "diffs_5_.tar.zip");
    assert_eq!((broken.baseline_count, broken.patch_count), (0, 0));
    assert_eq!(broken.min_patch_run_number, None);
    assert!(index.warnings.iter().any(|w| w.contains("diffs_5_.tar.zip")));
    assert_eq!(index.pointers.len(), 3);
}

#[test]
fn unparseable_patch_names_are_skipped_with_warning() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("diffs_0_.tar.zip");
    write_diff_archive(
        &path,
        &entries(&[
            ("baselines/Foo", "x\n"),
            ("patches/Foo_latest", "0;\n"),
            ("patches/Foo_2", "0;\n"),
        ]),
    )
    .unwrap();

    let index = index_all(&[path]);
    assert_eq!(index.pointers.len(), 1);
    assert_eq!(index.pointers[0].run_number, 2);
    assert!(index.warnings[0].contains("Foo_latest"));
}
