use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use rerun_archive::{read_patch_index, ArchiveEntryCache};
use rerun_contracts::{
    ARCHIVES_DIR, DEFAULT_COMPILE_TIMEOUT_SECS, DEFAULT_JAVA_VERSION, DEFAULT_TEST_TIMEOUT_SECS,
    DIFF_CACHE_DIR, ENRICHED_RUNS_DIR, PATCHES_INDEX_FILE, SHARED_WORKSPACE_DIR,
};
use rerun_host_runner::{
    compile, register_logging_extension, run_tests, OverlayMode, RunMarker, TestSelector,
    Toolchain, Workspace,
};

use crate::harvest::{harvest_and_copy, read_log};
use crate::materialize::{PatchSet, SelectionMode, SnapshotMaterializer};
use crate::model::{BatchReport, RunOutcome, RunStatusKind};

/// Everything a batch needs to know. Build with [`RerunOptions::new`] and the
/// `with_*` setters.
#[derive(Debug, Clone)]
pub struct RerunOptions {
    /// Holds `archives/` and `patches_index.jsonl`.
    pub input_dir: PathBuf,
    pub out_dir: PathBuf,
    pub work_dir: PathBuf,
    pub deps_dir: PathBuf,
    pub overlay_dir: Option<PathBuf>,
    pub java_home: Option<PathBuf>,
    pub java_version: u32,
    pub run: Option<u32>,
    pub test: Option<TestSelector>,
    pub keep_work_dir: bool,
    pub compile_timeout: Duration,
    pub test_timeout: Duration,
}

impl RerunOptions {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        deps_dir: impl Into<PathBuf>,
    ) -> Self {
        let out_dir = out_dir.into();
        Self {
            input_dir: input_dir.into(),
            work_dir: out_dir.join("work"),
            out_dir,
            deps_dir: deps_dir.into(),
            overlay_dir: None,
            java_home: None,
            java_version: DEFAULT_JAVA_VERSION,
            run: None,
            test: None,
            keep_work_dir: false,
            compile_timeout: Duration::from_secs(DEFAULT_COMPILE_TIMEOUT_SECS),
            test_timeout: Duration::from_secs(DEFAULT_TEST_TIMEOUT_SECS),
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_overlay_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.overlay_dir = dir;
        self
    }

    pub fn with_java_home(mut self, dir: Option<PathBuf>) -> Self {
        self.java_home = dir;
        self
    }

    pub fn with_java_version(mut self, version: u32) -> Self {
        self.java_version = version;
        self
    }

    pub fn with_run(mut self, run: Option<u32>) -> Self {
        self.run = run;
        self
    }

    pub fn with_test(mut self, test: Option<TestSelector>) -> Self {
        self.test = test;
        self
    }

    pub fn keep_work_dir(mut self, keep: bool) -> Self {
        self.keep_work_dir = keep;
        self
    }

    pub fn with_compile_timeout(mut self, timeout: Duration) -> Self {
        self.compile_timeout = timeout;
        self
    }

    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.input_dir.join(ARCHIVES_DIR)
    }

    pub fn patches_index_path(&self) -> PathBuf {
        self.input_dir.join(PATCHES_INDEX_FILE)
    }

    pub fn enriched_dir(&self) -> PathBuf {
        self.out_dir.join(ENRICHED_RUNS_DIR)
    }
}

/// Conditions that stop a batch before any run starts.
#[derive(Debug, Error)]
pub enum BatchAbort {
    #[error("input directory not found: {}", .0.display())]
    MissingInput(PathBuf),
    #[error("dependency directory not found: {}", .0.display())]
    MissingDeps(PathBuf),
    #[error("patch index not found: {}", .0.display())]
    MissingIndex(PathBuf),
    #[error("No patches found in {}", .0.display())]
    EmptyIndex(PathBuf),
    #[error("read patch index: {0:#}")]
    Index(anyhow::Error),
    #[error("prepare batch: {0:#}")]
    Setup(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Materialized,
    Compiled,
    Executed,
    Harvested,
    MaterializeFailed,
    CompileFailed,
    Exception,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Harvested
                | RunState::MaterializeFailed
                | RunState::CompileFailed
                | RunState::Exception
        )
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (from, Exception) => !from.is_terminal(),
            (Pending, Materialized | MaterializeFailed)
            | (Materialized, Compiled | CompileFailed)
            | (Compiled, Executed)
            | (Executed, Harvested) => true,
            _ => false,
        }
    }

    /// The outcome recorded for a run that stopped in this state.
    pub fn status(self) -> RunStatusKind {
        match self {
            RunState::Harvested => RunStatusKind::Executed,
            RunState::MaterializeFailed => RunStatusKind::MaterializeFailed,
            RunState::CompileFailed => RunStatusKind::CompileFailed,
            _ => RunStatusKind::Exception,
        }
    }
}

struct RunTracker {
    run: u32,
    state: RunState,
}

impl RunTracker {
    fn new(run: u32) -> Self {
        Self {
            run,
            state: RunState::Pending,
        }
    }

    fn advance(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            bail!(
                "illegal run state transition {:?} -> {:?}",
                self.state,
                next
            );
        }
        debug!(run = self.run, from = ?self.state, to = ?next, "run state");
        self.state = next;
        Ok(())
    }
}

/// The runs a batch will process: every available run, or the requested run,
/// or the nearest earlier one.
pub fn select_runs(patches: &PatchSet, requested: Option<u32>, warnings: &mut Vec<String>) -> Vec<u32> {
    let available = patches.available_runs();
    let Some(target) = requested else {
        return available;
    };
    if available.contains(&target) {
        return vec![target];
    }
    match patches.nearest_run_at_or_before(target) {
        Some(nearest) => {
            warnings.push(format!(
                "Run {target} has no patches; using nearest earlier run {nearest}"
            ));
            vec![nearest]
        }
        None => {
            warnings.push(format!("No patches found at or before run {target}"));
            Vec::new()
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

fn write_status_file(dir: &Path, outcome: &RunOutcome) -> Result<PathBuf> {
    let path = dir.join(format!("run_{}_status.json", outcome.run_number));
    let mut bytes = serde_json::to_vec_pretty(outcome).context("serialize run status")?;
    bytes.push(b'\n');
    std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

struct Batch<'a> {
    options: &'a RerunOptions,
    patches: PatchSet,
    cache: ArchiveEntryCache,
    workspace: Workspace,
    toolchain: Toolchain,
    enriched_dir: PathBuf,
    executed: BTreeSet<u32>,
    report: BatchReport,
}

impl Batch<'_> {
    fn run_one(&mut self, run: u32) -> RunOutcome {
        let mut tracker = RunTracker::new(run);
        let mut warnings = Vec::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.drive(&mut tracker, &mut warnings)
        }));
        let errors = match result {
            Ok(Ok(errors)) => errors,
            Ok(Err(err)) => {
                tracker.state = RunState::Exception;
                vec![format!("{err:#}")]
            }
            Err(payload) => {
                tracker.state = RunState::Exception;
                vec![format!("panic: {}", panic_message(payload.as_ref()))]
            }
        };
        if !tracker.state.is_terminal() {
            tracker.state = RunState::Exception;
        }
        RunOutcome {
            run_number: run,
            status: tracker.state.status(),
            errors,
            warnings,
        }
    }

    /// One pass of the per-run pipeline. Returns the errors of a run that
    /// stopped at a recorded failure state; `Err` is an unexpected failure.
    fn drive(&mut self, t: &mut RunTracker, warnings: &mut Vec<String>) -> Result<Vec<String>> {
        let run = t.run;
        self.workspace.clear_source_preserving_overlay()?;
        self.workspace.clear_compiled_output()?;

        let materializer = SnapshotMaterializer::new(self.options.archives_dir(), &self.cache);
        let snapshot = materializer.materialize(
            &self.patches,
            run,
            SelectionMode::LatestAtOrBefore,
            &self.workspace.src_dir(),
        );
        warnings.extend(snapshot.warnings);
        if snapshot.files_written == 0 {
            t.advance(RunState::MaterializeFailed)?;
            return Ok(vec!["No files materialized".to_string()]);
        }
        t.advance(RunState::Materialized)?;

        let marker = RunMarker::for_run(run);
        self.workspace.write_run_marker(&marker)?;

        let compiled = compile(
            &self.workspace,
            &self.options.deps_dir,
            &self.toolchain,
            self.options.compile_timeout,
        )?;
        if !compiled.success {
            t.advance(RunState::CompileFailed)?;
            return Ok(vec![format!(
                "Compilation failed - {}",
                compiled.errors.join("; ")
            )]);
        }
        t.advance(RunState::Compiled)?;
        self.report.runs_compiled += 1;

        match register_logging_extension(&self.workspace) {
            Ok(true) => {}
            Ok(false) => warnings.push(
                "LoggingExtension not found in compiled output; run.tar may be empty".to_string(),
            ),
            Err(e) => warnings.push(format!(
                "register logging extension: {:#}",
                anyhow::Error::new(e)
            )),
        }

        let summary = run_tests(
            &self.workspace,
            &self.options.deps_dir,
            &self.toolchain,
            self.options.test.as_ref(),
            &marker,
            self.options.test_timeout,
        )?;
        t.advance(RunState::Executed)?;
        self.executed.insert(run);
        self.report.runs_executed += 1;
        self.report.total_tests_found += u64::from(summary.found);
        self.report.total_tests_passed += u64::from(summary.succeeded);
        self.report.total_tests_failed += u64::from(summary.failed);
        if summary.timed_out {
            warnings.push(format!(
                "Test execution timed out after {} seconds",
                self.options.test_timeout.as_secs()
            ));
        }

        // An unreadable log costs the run its per-test results, not its status.
        match harvest_and_copy(&self.workspace, &self.enriched_dir) {
            Ok(harvested) => {
                warnings.extend(harvested.warnings);
                if let Some(logged) = harvested.run_number {
                    if logged != run {
                        warnings.push(format!(
                            "Log recorded run {logged} while replaying run {run}; filing results under {logged}"
                        ));
                    }
                    self.report.results_by_run.insert(logged, harvested.results);
                }
            }
            Err(e) => {
                let msg = format!("{:#}", anyhow::Error::new(e));
                warn!(run, "harvest failed: {msg}");
                warnings.push(msg);
            }
        }
        t.advance(RunState::Harvested)?;
        Ok(Vec::new())
    }

    fn record(&mut self, outcome: RunOutcome) {
        let run = outcome.run_number;
        for w in &outcome.warnings {
            self.report.warnings.push(format!("Run {run}: {w}"));
        }
        if outcome.status != RunStatusKind::Executed {
            let detail = outcome.errors.join("; ");
            error!(run, status = ?outcome.status, "{detail}");
            self.report.errors.push(format!("Run {run}: {detail}"));
            if let Err(e) = write_status_file(&self.enriched_dir, &outcome) {
                self.report
                    .warnings
                    .push(format!("Run {run}: status file not written: {e:#}"));
            }
        }
        self.report.outcomes.push(outcome);
    }

    fn cross_check_coverage(&mut self, attempted: &[u32]) {
        let log_path = self.workspace.side_channel_log_path();
        if !self.executed.is_empty() {
            match read_log(&log_path) {
                Ok(log) => {
                    let logged = log.logged_runs();
                    let missing: Vec<u32> = self
                        .executed
                        .iter()
                        .copied()
                        .filter(|r| !logged.contains(r))
                        .collect();
                    if !missing.is_empty() {
                        self.report.warnings.push(format!(
                            "Runs executed but missing from the side-channel log: {missing:?}"
                        ));
                    }
                }
                Err(e) => self
                    .report
                    .warnings
                    .push(format!(
                        "Cannot cross-check run coverage: {:#}",
                        anyhow::Error::new(e)
                    )),
            }
        }
        let failed = self.report.failed_runs();
        if !failed.is_empty() {
            self.report.warnings.push(format!(
                "Runs with status files (failed to complete): {failed:?}"
            ));
        }
        info!(
            attempted = attempted.len(),
            executed = self.executed.len(),
            failed = failed.len(),
            "batch coverage"
        );
    }
}

fn prepare(options: &RerunOptions) -> Result<(Workspace, OverlayMode, ArchiveEntryCache, PathBuf)> {
    let enriched_dir = options.enriched_dir();
    std::fs::create_dir_all(&enriched_dir)
        .with_context(|| format!("create dir: {}", enriched_dir.display()))?;
    std::fs::create_dir_all(&options.work_dir)
        .with_context(|| format!("create dir: {}", options.work_dir.display()))?;
    let cache = ArchiveEntryCache::new(options.work_dir.join(DIFF_CACHE_DIR));
    let workspace = Workspace::create(options.work_dir.join(SHARED_WORKSPACE_DIR))?;
    let overlay = workspace.install_overlay(options.overlay_dir.as_deref())?;
    Ok((workspace, overlay, cache, enriched_dir))
}

/// Replays every selected run in ascending order through one shared workspace.
///
/// Individual runs never abort the batch: each ends in a [`RunOutcome`], and
/// non-executed outcomes are also written as `run_<n>_status.json`.
pub fn run_batch(options: &RerunOptions) -> Result<BatchReport, BatchAbort> {
    if !options.input_dir.is_dir() {
        return Err(BatchAbort::MissingInput(options.input_dir.clone()));
    }
    if !options.deps_dir.is_dir() {
        return Err(BatchAbort::MissingDeps(options.deps_dir.clone()));
    }
    let index_path = options.patches_index_path();
    if !index_path.is_file() {
        return Err(BatchAbort::MissingIndex(index_path));
    }
    let pointers = read_patch_index(&index_path).map_err(BatchAbort::Index)?;
    if pointers.is_empty() {
        return Err(BatchAbort::EmptyIndex(index_path));
    }

    let mut report = BatchReport::default();
    let patches = PatchSet::new(pointers);
    report.warnings.extend(patches.warnings().iter().cloned());
    let runs = select_runs(&patches, options.run, &mut report.warnings);
    info!(runs = runs.len(), files = patches.file_keys().len(), "batch starting");

    let (workspace, overlay, cache, enriched_dir) = prepare(options).map_err(BatchAbort::Setup)?;
    if overlay == OverlayMode::Minimal {
        warn!("using minimal scaffolding");
        report
            .warnings
            .push("Using minimal testSupport (source not provided)".to_string());
    }

    let mut batch = Batch {
        options,
        patches,
        cache,
        workspace,
        toolchain: Toolchain::resolve(options.java_home.clone(), options.java_version),
        enriched_dir,
        executed: BTreeSet::new(),
        report,
    };
    for &run in &runs {
        info!(run, "replaying run");
        batch.report.runs_processed += 1;
        let outcome = batch.run_one(run);
        batch.record(outcome);
    }
    batch.cross_check_coverage(&runs);

    let Batch {
        workspace,
        mut report,
        cache,
        ..
    } = batch;
    debug!(extractions = cache.extractions(), "entry cache");
    if !options.keep_work_dir {
        if let Err(e) = workspace.remove() {
            report.warnings.push(format!("workspace not removed: {e:#}"));
        }
    }
    info!(
        processed = report.runs_processed,
        compiled = report.runs_compiled,
        executed = report.runs_executed,
        errors = report.errors.len(),
        "batch finished"
    );
    Ok(report)
}
