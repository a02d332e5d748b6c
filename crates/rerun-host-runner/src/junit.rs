use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use rerun_contracts::{
    CONSOLE_LAUNCHER_PREFIX, EXTENSION_SERVICE_FILE, LOGGER_DISABLE_SIZE_CHECKS_PROPERTY,
    LOGGER_PREV_RUN_PROPERTY, LOGGING_EXTENSION_CLASS, SCAFFOLD_PACKAGE, TEST_CLASS_SUFFIXES,
};

use crate::process::{run_with_wall_timeout, ProcessLimits};
use crate::toolchain::{classpath_jars, find_console_launcher, join_classpath, Toolchain};
use crate::workspace::{RunMarker, Workspace};
use crate::ToolchainError;

/// Restricts a run to one class, or one method of a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestSelector {
    Class(String),
    Method { class: String, method: String },
}

impl TestSelector {
    /// `Class` or `Class#method`; blank input selects nothing.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        match text.split_once('#') {
            Some((class, method)) if !method.trim().is_empty() => Some(TestSelector::Method {
                class: class.trim().to_string(),
                method: method.trim().to_string(),
            }),
            Some((class, _)) => Some(TestSelector::Class(class.trim().to_string())),
            None => Some(TestSelector::Class(text.to_string())),
        }
    }

    fn launcher_args(&self) -> [String; 2] {
        match self {
            TestSelector::Class(class) => ["--select-class".to_string(), class.clone()],
            TestSelector::Method { class, method } => {
                ["--select-method".to_string(), format!("{class}#{method}")]
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunSummary {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub found: u32,
    pub started: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub aborted: u32,
    pub skipped: u32,
    pub timed_out: bool,
}

impl TestRunSummary {
    /// The sentinel for a run that produced no countable tests.
    pub fn no_tests(stdout: String, stderr: String) -> Self {
        Self {
            exit_code: -1,
            stdout,
            stderr,
            ..Self::default()
        }
    }
}

fn summary_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        ["found", "started", "successful", "failed", "aborted", "skipped"]
            .into_iter()
            .filter_map(|label| {
                Regex::new(&format!(r"(?i)\[\s*(\d+)\s+tests?\s+{label}\s*\]"))
                    .ok()
                    .map(|re| (label, re))
            })
            .collect()
    })
}

/// Reads the launcher's `[ N tests <label> ]` summary lines; absent labels count 0.
pub fn parse_summary(exit_code: i32, stdout: String, stderr: String) -> TestRunSummary {
    let mut out = TestRunSummary {
        exit_code,
        ..TestRunSummary::default()
    };
    for (label, re) in summary_patterns() {
        let n = re
            .captures(&stdout)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(0);
        match *label {
            "found" => out.found = n,
            "started" => out.started = n,
            "successful" => out.succeeded = n,
            "failed" => out.failed = n,
            "aborted" => out.aborted = n,
            "skipped" => out.skipped = n,
            _ => {}
        }
    }
    out.stdout = stdout;
    out.stderr = stderr;
    out
}

/// Fully qualified names of top-level classes under `bin_dir` that follow the
/// test naming convention, excluding the scaffolding package.
pub fn discover_test_classes(bin_dir: &Path) -> Vec<String> {
    let scaffold_prefix = format!("{SCAFFOLD_PACKAGE}.");
    let mut out: Vec<String> = walkdir::WalkDir::new(bin_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(bin_dir).ok()?.to_string_lossy().into_owned();
            let stem = rel.strip_suffix(".class")?;
            if stem.contains('$') {
                return None;
            }
            Some(stem.replace(['/', '\\'], "."))
        })
        .filter(|name| TEST_CLASS_SUFFIXES.iter().any(|s| name.ends_with(s)))
        .filter(|name| !name.starts_with(&scaffold_prefix))
        .collect();
    out.sort();
    out
}

/// Registers the scaffolding's logging hook for extension autodetection when
/// its class was compiled. Returns whether the hook is registered.
pub fn register_logging_extension(workspace: &Workspace) -> Result<bool, ToolchainError> {
    let bin = workspace.bin_dir();
    let hook_class = bin.join(SCAFFOLD_PACKAGE).join(LOGGING_EXTENSION_CLASS);
    if !hook_class.is_file() {
        return Ok(false);
    }
    let service = bin.join(EXTENSION_SERVICE_FILE);
    let io_err = |source: std::io::Error| ToolchainError::Io {
        path: service.clone(),
        source,
    };
    if let Some(parent) = service.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let class_name = LOGGING_EXTENSION_CLASS
        .strip_suffix(".class")
        .unwrap_or(LOGGING_EXTENSION_CLASS);
    std::fs::write(&service, format!("{SCAFFOLD_PACKAGE}.{class_name}\n")).map_err(io_err)?;
    debug!(service = %service.display(), "logging extension registered");
    Ok(true)
}

/// Waits, bounded, for the side-channel log's size to stop changing so a
/// late flush from the exiting runtime is not cut off.
fn settle_side_channel_log(path: &Path, budget: Duration) {
    let deadline = Instant::now() + budget;
    let mut last: Option<u64> = None;
    loop {
        let size = std::fs::metadata(path).ok().map(|m| m.len());
        if size.is_some() && size == last {
            return;
        }
        if Instant::now() >= deadline {
            return;
        }
        last = size;
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Runs the workspace's tests through the console launcher in a fresh runtime
/// process. Each call gets its own process group, so nothing loaded by one run
/// can leak into the next.
pub fn run_tests(
    workspace: &Workspace,
    deps_dir: &Path,
    toolchain: &Toolchain,
    selector: Option<&TestSelector>,
    marker: &RunMarker,
    timeout: Duration,
) -> Result<TestRunSummary, ToolchainError> {
    let Some(launcher) = find_console_launcher(deps_dir) else {
        warn!(deps = %deps_dir.display(), "console launcher jar missing");
        return Ok(TestRunSummary::no_tests(
            String::new(),
            format!(
                "{CONSOLE_LAUNCHER_PREFIX} jar not found in {}",
                deps_dir.display()
            ),
        ));
    };

    let mut classpath: Vec<PathBuf> = vec![workspace.bin_dir()];
    classpath.extend(classpath_jars(deps_dir, true));

    let mut cmd = Command::new(toolchain.java());
    cmd.current_dir(workspace.root());
    cmd.arg(format!("-D{LOGGER_DISABLE_SIZE_CHECKS_PROPERTY}=true"));
    cmd.arg(format!(
        "-D{LOGGER_PREV_RUN_PROPERTY}={}",
        marker.prev_run_number
    ));
    cmd.arg("-jar").arg(&launcher);
    cmd.arg("--class-path").arg(join_classpath(&classpath));
    cmd.args(["--disable-ansi-colors", "--details=tree"]);
    cmd.args([
        "--config",
        "junit.jupiter.extensions.autodetection.enabled=true",
    ]);

    match selector {
        Some(sel) => {
            cmd.args(sel.launcher_args());
        }
        None => {
            let classes = discover_test_classes(&workspace.bin_dir());
            if classes.is_empty() {
                cmd.arg("--scan-class-path");
            }
            for class in &classes {
                cmd.arg("--select-class").arg(class);
            }
        }
    }

    info!(prev_run = marker.prev_run_number, selector = ?selector, "running tests");
    let out = run_with_wall_timeout(cmd, &ProcessLimits::with_timeout(timeout))?;
    if out.timed_out {
        let err = ToolchainError::Timeout {
            program: toolchain.java().display().to_string(),
            timeout,
        };
        let mut stderr = out.stderr_text();
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&err.to_string());
        return Ok(TestRunSummary {
            timed_out: true,
            ..TestRunSummary::no_tests(out.stdout_text(), stderr)
        });
    }

    settle_side_channel_log(&workspace.side_channel_log_path(), Duration::from_secs(1));
    let summary = parse_summary(out.exit_status, out.stdout_text(), out.stderr_text());
    info!(
        exit = summary.exit_code,
        found = summary.found,
        succeeded = summary.succeeded,
        failed = summary.failed,
        elapsed = ?out.elapsed,
        "tests finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parsing() {
        assert_eq!(TestSelector::parse("  "), None);
        assert_eq!(
            TestSelector::parse("FooTest"),
            Some(TestSelector::Class("FooTest".to_string()))
        );
        assert_eq!(
            TestSelector::parse("pkg.FooTest#testAdd"),
            Some(TestSelector::Method {
                class: "pkg.FooTest".to_string(),
                method: "testAdd".to_string()
            })
        );
        assert_eq!(
            TestSelector::parse("FooTest#"),
            Some(TestSelector::Class("FooTest".to_string()))
        );
    }
}
