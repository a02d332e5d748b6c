use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use rerun_contracts::{EVIDENCE_ENTRY_PREFIX, MIN_PLAUSIBLE_LOG_BYTES, TEST_RUN_INFO_ENTRY};
use rerun_host_runner::Workspace;

use crate::model::{EnrichedTestResult, TestStatus};

/// Top-level keys of `testRunInfo.json` that are logger bookkeeping, not test
/// classes.
const RESERVED_KEYS: &[&str] = &[
    "prevRunNumber",
    "randomSeed",
    "redactDiffs",
    "rebaselining",
    "toIgnore",
    "skipLogging",
    "strikes",
    "prevBaselineRunNumber",
    "runTimes",
];

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("{}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}: no {TEST_RUN_INFO_ENTRY} entry in side-channel log", path.display())]
    MissingRunInfo { path: PathBuf },
    #[error("{}: malformed {entry}", path.display())]
    Malformed {
        path: PathBuf,
        entry: String,
        source: serde_json::Error,
    },
    #[error("{}: {TEST_RUN_INFO_ENTRY} is not a JSON object", path.display())]
    NotAnObject { path: PathBuf },
    #[error("{}: log records no run number", path.display())]
    NoRunNumber { path: PathBuf },
    #[error("write {}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// What the instrumented run captured for one test beyond its status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEvidence {
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub exception_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub actual: Option<String>,
    #[serde(default)]
    pub unique_id: Option<String>,
}

/// The parsed contents of a side-channel log.
#[derive(Debug, Clone, Default)]
pub struct SideChannelLog {
    pub run_info: Map<String, Value>,
    /// run -> testId -> evidence
    pub evidence: BTreeMap<u32, BTreeMap<String, TestEvidence>>,
    pub warnings: Vec<String>,
}

fn parse_run_key(key: &str) -> Option<u32> {
    key.trim().parse().ok()
}

impl SideChannelLog {
    /// Runs the logger recorded a start time for.
    pub fn logged_runs(&self) -> BTreeSet<u32> {
        self.run_info
            .get("runTimes")
            .and_then(Value::as_object)
            .map(|m| m.keys().filter_map(|k| parse_run_key(k)).collect())
            .unwrap_or_default()
    }

    fn test_classes(&self) -> impl Iterator<Item = (&String, &Map<String, Value>)> + '_ {
        self.run_info
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .filter_map(|(k, v)| v.as_object().map(|m| (k, m)))
    }

    /// `prevRunNumber`, else the greatest `runTimes` key, else the greatest run
    /// any test recorded.
    pub fn recorded_run_number(&self) -> Option<u32> {
        if let Some(n) = self
            .run_info
            .get("prevRunNumber")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
        {
            return Some(n);
        }
        if let Some(n) = self.logged_runs().into_iter().next_back() {
            return Some(n);
        }
        self.test_classes()
            .flat_map(|(_, tests)| tests.values())
            .filter_map(Value::as_object)
            .flat_map(|runs| runs.keys())
            .filter_map(|k| parse_run_key(k))
            .max()
    }

    /// Every test with a status for `run`, sorted by test id, merged with the
    /// evidence recorded for that run.
    pub fn results_for_run(&self, run: u32, warnings: &mut Vec<String>) -> Vec<EnrichedTestResult> {
        let run_key = run.to_string();
        let evidence = self.evidence.get(&run);
        let mut out = Vec::new();
        for (class, tests) in self.test_classes() {
            for (display_name, runs) in tests {
                let Some(runs) = runs.as_object() else {
                    continue;
                };
                for key in runs.keys() {
                    if parse_run_key(key).is_none() {
                        warnings.push(format!(
                            "Ignoring non-integer run key '{key}' for {class}#{display_name}"
                        ));
                    }
                }
                let Some(raw) = runs.get(&run_key) else {
                    continue;
                };
                let mut result = parse_status(class, display_name, raw, warnings);
                if let Some(ev) = evidence.and_then(|e| e.get(&result.test_id)) {
                    merge_evidence(&mut result, ev);
                }
                out.push(result);
            }
        }
        out.sort_by(|a, b| a.test_id.cmp(&b.test_id));
        out
    }
}

/// `"STATUS"` or `"STATUS: cause"`. Unknown tokens become `ABORTED` with the
/// raw text as cause.
fn parse_status(
    class: &str,
    display_name: &str,
    raw: &Value,
    warnings: &mut Vec<String>,
) -> EnrichedTestResult {
    let text = match raw {
        Value::Null => return EnrichedTestResult::new(class, display_name, TestStatus::Aborted, None),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    let (token, cause) = match text.split_once(": ") {
        Some((token, cause)) => (token, Some(cause.trim().to_string())),
        None => (text.as_str(), None),
    };
    match TestStatus::from_token(token) {
        Some(status) => EnrichedTestResult::new(class, display_name, status, cause),
        None => {
            warnings.push(format!(
                "Unknown test status token: '{token}' in string: '{text}'"
            ));
            EnrichedTestResult::new(class, display_name, TestStatus::Aborted, Some(text.clone()))
        }
    }
}

fn merge_evidence(result: &mut EnrichedTestResult, ev: &TestEvidence) {
    result.duration_ms = ev.duration_ms;
    result.stack_trace = ev.stack_trace.clone();
    result.exception_type = ev.exception_type.clone();
    result.message = ev.message.clone();
    result.expected = ev.expected.clone();
    result.actual = ev.actual.clone();
    result.unique_id = ev.unique_id.clone();
}

fn evidence_run(name: &str) -> Option<u32> {
    name.strip_prefix(EVIDENCE_ENTRY_PREFIX)?
        .strip_suffix(".json")
        .and_then(parse_run_key)
}

/// Reads a side-channel log. The last `testRunInfo.json` entry wins; a
/// malformed evidence entry is a warning, a malformed run-info entry is not.
pub fn read_log(path: &Path) -> Result<SideChannelLog, HarvestError> {
    let io_err = |source: std::io::Error| HarvestError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = std::fs::File::open(path).map_err(io_err)?;
    let mut archive = tar::Archive::new(file);
    let mut log = SideChannelLog::default();
    let mut run_info: Option<Value> = None;

    for entry in archive.entries().map_err(io_err)? {
        let mut entry = entry.map_err(io_err)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path().map_err(io_err)?.to_string_lossy().into_owned();
        let name = name.strip_prefix("./").unwrap_or(&name).to_string();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(io_err)?;

        if name == TEST_RUN_INFO_ENTRY {
            let value = serde_json::from_slice(&bytes).map_err(|source| HarvestError::Malformed {
                path: path.to_path_buf(),
                entry: name.clone(),
                source,
            })?;
            run_info = Some(value);
        } else if let Some(run) = evidence_run(&name) {
            match serde_json::from_slice::<BTreeMap<String, TestEvidence>>(&bytes) {
                Ok(records) => {
                    log.evidence.entry(run).or_default().extend(records);
                }
                Err(e) => log.warnings.push(format!("Ignoring malformed {name}: {e}")),
            }
        }
    }

    match run_info {
        Some(Value::Object(map)) => log.run_info = map,
        Some(_) => {
            return Err(HarvestError::NotAnObject {
                path: path.to_path_buf(),
            })
        }
        None => {
            return Err(HarvestError::MissingRunInfo {
                path: path.to_path_buf(),
            })
        }
    }
    if !log.run_info.contains_key("runTimes") {
        log.warnings
            .push("Missing or invalid runTimes node in test run info".to_string());
    }
    Ok(log)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestOutcome {
    /// `None` when there was no usable log to read.
    pub run_number: Option<u32>,
    pub results: Vec<EnrichedTestResult>,
    pub warnings: Vec<String>,
}

/// Reads the results of the run the log itself says it recorded.
pub fn harvest(workspace: &Workspace) -> Result<HarvestOutcome, HarvestError> {
    let path = workspace.side_channel_log_path();
    let mut outcome = HarvestOutcome::default();

    let size = match std::fs::metadata(&path) {
        Ok(m) => m.len(),
        Err(_) => {
            let msg = format!(
                "Side-channel log missing at {}; the logging extension probably never attached",
                path.display()
            );
            warn!("{msg}");
            outcome.warnings.push(msg);
            return Ok(outcome);
        }
    };
    if size < MIN_PLAUSIBLE_LOG_BYTES {
        let msg = format!(
            "Side-channel log at {} is only {size} bytes; the logging extension probably never attached",
            path.display()
        );
        warn!("{msg}");
        outcome.warnings.push(msg);
        return Ok(outcome);
    }

    let log = read_log(&path)?;
    outcome.warnings.extend(log.warnings.iter().cloned());
    let run = log
        .recorded_run_number()
        .ok_or_else(|| HarvestError::NoRunNumber { path: path.clone() })?;
    outcome.results = log.results_for_run(run, &mut outcome.warnings);
    outcome.run_number = Some(run);
    info!(run, tests = outcome.results.len(), "harvested");
    Ok(outcome)
}

/// [`harvest`], then persists `enriched_<run>.json` and a copy of the log as
/// `run_<run>.tar` under `enriched_dir`. Nothing is written without a log.
pub fn harvest_and_copy(
    workspace: &Workspace,
    enriched_dir: &Path,
) -> Result<HarvestOutcome, HarvestError> {
    let outcome = harvest(workspace)?;
    let Some(run) = outcome.run_number else {
        return Ok(outcome);
    };
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| HarvestError::Write { path, source }
    };

    let enriched = enriched_dir.join(format!("enriched_{run}.json"));
    let mut body = serde_json::to_vec_pretty(&outcome.results).map_err(|source| {
        HarvestError::Malformed {
            path: enriched.clone(),
            entry: "enriched results".to_string(),
            source,
        }
    })?;
    body.push(b'\n');
    std::fs::write(&enriched, body).map_err(write_err(&enriched))?;

    let copy = enriched_dir.join(format!("run_{run}.tar"));
    std::fs::copy(workspace.side_channel_log_path(), &copy).map_err(write_err(&copy))?;
    debug!(enriched = %enriched.display(), log = %copy.display(), "harvest persisted");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_from(value: Value) -> SideChannelLog {
        SideChannelLog {
            run_info: value.as_object().cloned().unwrap(),
            ..SideChannelLog::default()
        }
    }

    #[test]
    fn status_with_cause_splits_at_first_separator() {
        let mut w = Vec::new();
        let r = parse_status(
            "FooTest",
            "adds",
            &Value::String("FAILED: expected: <1> but was: <2>".into()),
            &mut w,
        );
        assert_eq!(r.status, TestStatus::Failed);
        assert_eq!(r.cause.as_deref(), Some("expected: <1> but was: <2>"));
        assert!(w.is_empty());
    }

    #[test]
    fn unknown_token_is_aborted_with_raw_cause() {
        let mut w = Vec::new();
        let r = parse_status("FooTest", "adds", &Value::String(" EXPLODED: boom ".into()), &mut w);
        assert_eq!(r.status, TestStatus::Aborted);
        assert_eq!(r.cause.as_deref(), Some("EXPLODED: boom"));
        assert_eq!(
            w,
            vec!["Unknown test status token: 'EXPLODED' in string: 'EXPLODED: boom'".to_string()]
        );
    }

    #[test]
    fn run_number_fallbacks() {
        let with_prev = log_from(serde_json::json!({
            "prevRunNumber": 4,
            "runTimes": {"1": "t", "9": "t"},
        }));
        assert_eq!(with_prev.recorded_run_number(), Some(4));

        let from_times = log_from(serde_json::json!({"runTimes": {"2": "t", "10": "t"}}));
        assert_eq!(from_times.recorded_run_number(), Some(10));
        assert_eq!(from_times.logged_runs(), BTreeSet::from([2, 10]));

        let from_tests = log_from(serde_json::json!({
            "FooTest": {"adds": {"3": "SUCCESSFUL", "6": "FAILED"}},
        }));
        assert_eq!(from_tests.recorded_run_number(), Some(6));

        assert_eq!(log_from(serde_json::json!({})).recorded_run_number(), None);
    }

    #[test]
    fn results_skip_reserved_keys_and_sort_by_id() {
        let log = log_from(serde_json::json!({
            "prevRunNumber": 2,
            "strikes": {"x": {"2": "FAILED"}},
            "ZTest": {"b": {"2": "SUCCESSFUL"}},
            "ATest": {"z": {"2": "DISABLED"}, "a": {"1": "SUCCESSFUL", "x": "FAILED"}},
        }));
        let mut w = Vec::new();
        let ids: Vec<String> = log
            .results_for_run(2, &mut w)
            .into_iter()
            .map(|r| r.test_id)
            .collect();
        assert_eq!(ids, vec!["ATest#z", "ZTest#b"]);
        assert_eq!(w.len(), 1);
        assert!(w[0].contains("non-integer run key 'x'"));
    }
}
