#![cfg(unix)]

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rerun::{run_batch, BatchAbort, RerunOptions, RunStatusKind, TestStatus};
use rerun_archive::{index_dir, write_diff_archive, write_index};

static SCRIPT_LOCK: Mutex<()> = Mutex::new(());

// Mirrors the package layout under src/ into bin/; any source containing
// BROKEN fails the compile.
const JAVAC: &str = r#"#!/bin/sh
out=""
status=0
while [ $# -gt 0 ]; do
  case "$1" in
    -d) out="$2"; shift 2 ;;
    -source|-target|-encoding|-cp) shift 2 ;;
    *.java)
      if grep -q BROKEN "$1"; then
        echo "$1:2: error: cannot find symbol BROKEN" >&2
        status=1
      fi
      rel=${1##*/src/}
      mkdir -p "$out/$(dirname "$rel")"
      : > "$out/${rel%.java}.class"
      shift ;;
    *) shift ;;
  esac
done
exit $status
"#;

// Plays the instrumented runtime: reads the run marker, records what it can
// see of the workspace, and appends this run to an accumulating tar log.
const JAVA: &str = r#"#!/bin/sh
support=src/testSupport
prev=$(sed -n 's/.*"prevRunNumber": *\([0-9][0-9]*\).*/\1/p' "$support/startTestRunInfo.json")
run=$((prev + 1))
state="$support/.state"
mkdir -p "$state/evidence"
[ -e bin/leftover.flag ] && echo "bin $run" >> "$state/leaks"
[ -e src/Leftover.java ] && echo "src $run" >> "$state/leaks"
: > bin/leftover.flag
echo "class Leftover {}" > src/Leftover.java
cp src/FooTest.java "$state/src_$run.txt"
echo "$run" >> "$state/runs"
runs=$(cat "$state/runs")
{
  printf '{"prevRunNumber": %s, "runTimes": {' "$run"
  sep=""
  for r in $runs; do printf '%s"%s": "2024-01-01 00:00:00.0"' "$sep" "$r"; sep=", "; done
  printf '}, "FooTest": {"testAdd": {'
  sep=""
  for r in $runs; do printf '%s"%s": "SUCCESSFUL"' "$sep" "$r"; sep=", "; done
  printf '}, "testSub": {'
  sep=""
  for r in $runs; do printf '%s"%s": "FAILED: expected <1> but was <2>"' "$sep" "$r"; sep=", "; done
  printf '}}}\n'
} > "$state/testRunInfo.json"
printf '{"FooTest#testSub": {"durationMs": 12, "exceptionType": "org.opentest4j.AssertionFailedError", "expected": "1", "actual": "2"}}\n' > "$state/evidence/$run.json"
(cd "$state" && tar -cf ../run.tar testRunInfo.json evidence)
cat <<'EOF'
[         2 tests found           ]
[         2 tests started         ]
[         1 tests successful      ]
[         1 tests failed          ]
EOF
exit 1
"#;

// Same runtime, but the log it leaves behind is not valid JSON.
const JAVA_GARBLED_LOG: &str = r#"#!/bin/sh
state=src/testSupport/.state
mkdir -p "$state"
printf '{"prevRunNumber": 1, BROKEN' > "$state/testRunInfo.json"
(cd "$state" && tar -cf ../run.tar testRunInfo.json)
cat <<'EOF'
[         2 tests found           ]
[         2 tests started         ]
[         2 tests successful      ]
[         0 tests failed          ]
EOF
exit 0
"#;

const BASELINE: &str = "public class FooTest {\n    int v = 0;\n}\n";

fn set_v(v: &str) -> String {
    format!("1;\nCHANGE\n1,1\n1,\n    int v = 0;\n1,\n    int v = {v};\n")
}

fn write_script(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut f = std::fs::File::create(path).unwrap();
    f.write_all(body.as_bytes()).unwrap();
    f.sync_all().unwrap();
    drop(f);
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn have_system_tar() -> bool {
    std::process::Command::new("tar")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

struct Fixture {
    _tmp: tempfile::TempDir,
    input: PathBuf,
    out: PathBuf,
    options: RerunOptions,
}

fn fixture(patches: &[(u32, String)]) -> Fixture {
    fixture_with_java(patches, JAVA)
}

fn fixture_with_java(patches: &[(u32, String)], java: &str) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().to_path_buf();

    let input = root.join("input");
    let archives = input.join("archives");
    std::fs::create_dir_all(&archives).unwrap();
    let mut entries = vec![(
        "baselines/FooTest.java.FooTest".to_string(),
        BASELINE.as_bytes().to_vec(),
    )];
    for (run, body) in patches {
        entries.push((
            format!("patches/FooTest.java.FooTest_{run}"),
            body.as_bytes().to_vec(),
        ));
    }
    write_diff_archive(&archives.join("diffs_0_.tar.zip"), &entries).unwrap();
    write_index(&index_dir(&archives).unwrap(), &input).unwrap();

    let deps = root.join("deps");
    std::fs::create_dir_all(&deps).unwrap();
    std::fs::write(deps.join("junit-platform-console-standalone-1.10.2.jar"), b"").unwrap();

    let overlay = root.join("overlay");
    std::fs::create_dir_all(&overlay).unwrap();
    std::fs::write(
        overlay.join("LoggingExtension.java"),
        "package testSupport;\npublic class LoggingExtension {}\n",
    )
    .unwrap();

    let home = root.join("jdk");
    write_script(&home.join("bin/javac"), JAVAC);
    write_script(&home.join("bin/java"), java);

    let out = root.join("out");
    let options = RerunOptions::new(&input, &out, &deps)
        .with_overlay_dir(Some(overlay))
        .with_java_home(Some(home))
        .with_compile_timeout(Duration::from_secs(30))
        .with_test_timeout(Duration::from_secs(30));
    Fixture {
        _tmp: tmp,
        input,
        out,
        options,
    }
}

#[test]
fn corrupted_run_does_not_stop_the_batch() {
    let _guard = SCRIPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if !have_system_tar() {
        eprintln!("skipping: no tar on PATH");
        return;
    }
    let corrupt = "1;\nDELETE\n1,1\n1,\n    int v = 99;\n0,\n".to_string();
    let fx = fixture(&[
        (1, set_v("1")),
        (2, set_v("2")),
        (3, corrupt),
        (4, set_v("4")),
        (5, set_v("5")),
    ]);
    let options = fx.options.clone().keep_work_dir(true);

    let report = run_batch(&options).unwrap();
    assert_eq!(report.runs_processed, 5);
    assert_eq!(report.runs_compiled, 4);
    assert_eq!(report.runs_executed, 4);
    assert_eq!(report.total_tests_found, 8);
    assert_eq!(report.total_tests_passed, 4);
    assert_eq!(report.total_tests_failed, 4);
    assert_eq!(report.errors, ["Run 3: No files materialized"]);
    assert_eq!(
        report.results_by_run.keys().copied().collect::<Vec<_>>(),
        [1, 2, 4, 5]
    );
    assert!(
        !report.warnings.iter().any(|w| w.contains("LoggingExtension")),
        "{:?}",
        report.warnings
    );
    assert!(!report
        .warnings
        .iter()
        .any(|w| w.contains("missing from the side-channel log")));
    assert!(report
        .warnings
        .iter()
        .any(|w| w == "Runs with status files (failed to complete): [3]"));

    let run2 = &report.results_by_run[&2];
    assert_eq!(run2.len(), 2);
    assert_eq!(run2[0].test_id, "FooTest#testAdd");
    assert_eq!(run2[0].status, TestStatus::Successful);
    assert_eq!(run2[1].test_id, "FooTest#testSub");
    assert_eq!(run2[1].status, TestStatus::Failed);
    assert_eq!(run2[1].cause.as_deref(), Some("expected <1> but was <2>"));
    assert_eq!(run2[1].duration_ms, Some(12));

    let enriched = fx.out.join("enriched_runs");
    for run in [1, 2, 4, 5] {
        assert!(enriched.join(format!("enriched_{run}.json")).is_file());
        assert!(enriched.join(format!("run_{run}.tar")).is_file());
        assert!(!enriched.join(format!("run_{run}_status.json")).exists());
    }
    assert!(!enriched.join("enriched_3.json").exists());
    let status: serde_json::Value =
        serde_json::from_slice(&std::fs::read(enriched.join("run_3_status.json")).unwrap())
            .unwrap();
    assert_eq!(status["runNumber"], 3);
    assert_eq!(status["status"], "materialize_failed");
    assert_eq!(status["errors"][0], "No files materialized");
    assert!(status["warnings"][0]
        .as_str()
        .unwrap()
        .starts_with("Failed to reconstruct FooTest.java.FooTest:"));

    let state = fx
        .out
        .join("work/workspace_shared/src/testSupport/.state");
    assert!(!state.join("leaks").exists(), "a run saw the previous run's files");
    let src5 = std::fs::read_to_string(state.join("src_5.txt")).unwrap();
    assert!(src5.contains("int v = 5;"), "{src5}");
    let src2 = std::fs::read_to_string(state.join("src_2.txt")).unwrap();
    assert!(src2.contains("int v = 2;"), "{src2}");
}

#[test]
fn compile_failure_is_recorded_and_workspace_removed() {
    let _guard = SCRIPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if !have_system_tar() {
        eprintln!("skipping: no tar on PATH");
        return;
    }
    let fx = fixture(&[(1, set_v("1")), (2, set_v("BROKEN"))]);

    let report = run_batch(&fx.options).unwrap();
    assert_eq!(report.runs_processed, 2);
    assert_eq!(report.runs_compiled, 1);
    assert_eq!(report.outcomes[1].status, RunStatusKind::CompileFailed);
    assert_eq!(report.errors.len(), 1);
    assert!(
        report.errors[0].starts_with("Run 2: Compilation failed - "),
        "{:?}",
        report.errors
    );
    assert!(report.errors[0].contains("cannot find symbol BROKEN"));

    let status: serde_json::Value = serde_json::from_slice(
        &std::fs::read(fx.out.join("enriched_runs/run_2_status.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(status["status"], "compile_failed");
    assert!(!fx.out.join("work/workspace_shared").exists());
    assert!(fx.out.join("work/diff_cache").is_dir());
}

#[test]
fn unreadable_log_is_a_warning_not_a_failed_run() {
    let _guard = SCRIPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if !have_system_tar() {
        eprintln!("skipping: no tar on PATH");
        return;
    }
    let fx = fixture_with_java(&[(1, set_v("1"))], JAVA_GARBLED_LOG);

    let report = run_batch(&fx.options).unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].status, RunStatusKind::Executed);
    assert!(report.outcomes[0].errors.is_empty());
    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.runs_executed, 1);
    assert_eq!(report.total_tests_found, 2);
    assert_eq!(report.total_tests_passed, 2);
    assert!(report.results_by_run.is_empty());

    let malformed: Vec<&String> = report
        .warnings
        .iter()
        .filter(|w| w.starts_with("Run 1: ") && w.contains("malformed testRunInfo.json"))
        .collect();
    assert_eq!(malformed.len(), 1, "{:?}", report.warnings);
    assert_eq!(
        malformed[0].matches("key must be a string").count(),
        1,
        "cause rendered more than once: {}",
        malformed[0]
    );

    let enriched = fx.out.join("enriched_runs");
    assert!(!enriched.join("run_1_status.json").exists());
    assert!(!enriched.join("enriched_1.json").exists());
}

#[test]
fn single_run_selection_falls_back_to_nearest_earlier_run() {
    let _guard = SCRIPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if !have_system_tar() {
        eprintln!("skipping: no tar on PATH");
        return;
    }
    let fx = fixture(&[(2, set_v("2")), (6, set_v("6"))]);
    let options = fx.options.clone().with_run(Some(5));

    let report = run_batch(&options).unwrap();
    assert_eq!(report.runs_processed, 1);
    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.results_by_run.keys().copied().collect::<Vec<_>>(), [2]);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("using nearest earlier run 2")));
}

#[test]
fn empty_or_missing_index_aborts_before_any_run() {
    let fx = fixture(&[(1, set_v("1"))]);
    let index = fx.input.join("patches_index.jsonl");

    std::fs::write(&index, "\n").unwrap();
    let err = run_batch(&fx.options).unwrap_err();
    assert!(matches!(err, BatchAbort::EmptyIndex(_)), "{err}");
    assert!(err.to_string().starts_with("No patches found in "));

    std::fs::remove_file(&index).unwrap();
    let err = run_batch(&fx.options).unwrap_err();
    assert!(matches!(err, BatchAbort::MissingIndex(_)), "{err}");
    assert!(!fx.out.join("enriched_runs").exists());

    let options = fx.options.clone();
    let options = RerunOptions {
        deps_dir: fx.input.join("nope"),
        ..options
    };
    let err = run_batch(&options).unwrap_err();
    assert!(matches!(err, BatchAbort::MissingDeps(_)), "{err}");
}
