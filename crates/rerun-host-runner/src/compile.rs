use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rerun_contracts::SOURCE_EXTENSION;

use crate::process::{run_with_wall_timeout, ProcessLimits};
use crate::toolchain::{classpath_jars, join_classpath, Toolchain};
use crate::workspace::Workspace;
use crate::ToolchainError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub errors: Vec<String>,
    pub timed_out: bool,
}

impl CompileOutcome {
    fn failure(stdout: String, stderr: String, exit_code: i32, errors: Vec<String>) -> Self {
        Self {
            success: false,
            stdout,
            stderr,
            exit_code,
            errors,
            timed_out: false,
        }
    }
}

/// Groups compiler stderr into one message per diagnostic: a line naming
/// `: error:` or `: warning:` starts a message, following non-blank lines
/// (source excerpt, caret, notes) belong to it.
pub fn parse_compiler_messages(stderr: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in stderr.lines() {
        if line.contains(": error:") || line.contains(": warning:") {
            if !current.is_empty() {
                out.push(current.trim().to_string());
            }
            current = line.to_string();
        } else if !current.is_empty() && !line.trim().is_empty() {
            current.push('\n');
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn collect_sources(src_dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = walkdir::WalkDir::new(src_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with(SOURCE_EXTENSION))
        })
        .collect();
    out.sort();
    out
}

/// Compiles every source file under the workspace's `src/` into `bin/`.
///
/// Only a failure to start the compiler is an `Err`; a timeout or a nonzero exit
/// is an unsuccessful outcome carrying the diagnostics.
pub fn compile(
    workspace: &Workspace,
    deps_dir: &Path,
    toolchain: &Toolchain,
    timeout: Duration,
) -> Result<CompileOutcome, ToolchainError> {
    let sources = collect_sources(&workspace.src_dir());
    if sources.is_empty() {
        warn!(src = %workspace.src_dir().display(), "no source files to compile");
        return Ok(CompileOutcome::failure(
            String::new(),
            "No source files found in src/".to_string(),
            1,
            vec!["No source files found".to_string()],
        ));
    }

    let version = toolchain.java_version.to_string();
    let mut cmd = Command::new(toolchain.javac());
    cmd.current_dir(workspace.root());
    cmd.arg("-source").arg(&version);
    cmd.arg("-target").arg(&version);
    cmd.arg("-encoding").arg("UTF-8");
    let jars = classpath_jars(deps_dir, false);
    if !jars.is_empty() {
        cmd.arg("-cp").arg(join_classpath(&jars));
    }
    cmd.arg("-d").arg(workspace.bin_dir());
    cmd.args(&sources);

    info!(files = sources.len(), java_version = %version, "compiling");
    let out = run_with_wall_timeout(cmd, &ProcessLimits::with_timeout(timeout))?;
    let stdout = out.stdout_text();
    let stderr = out.stderr_text();

    if out.timed_out {
        let err = ToolchainError::Timeout {
            program: toolchain.javac().display().to_string(),
            timeout,
        };
        return Ok(CompileOutcome {
            timed_out: true,
            ..CompileOutcome::failure(stdout, stderr, -1, vec![err.to_string()])
        });
    }
    if out.exit_status != 0 {
        let mut errors = parse_compiler_messages(&stderr);
        if errors.is_empty() {
            errors.push(format!("compiler exited with status {}", out.exit_status));
        }
        info!(exit = out.exit_status, errors = errors.len(), "compile failed");
        return Ok(CompileOutcome::failure(stdout, stderr, out.exit_status, errors));
    }

    info!(elapsed = ?out.elapsed, "compile succeeded");
    Ok(CompileOutcome {
        success: true,
        stdout,
        stderr,
        exit_code: 0,
        errors: Vec::new(),
        timed_out: false,
    })
}
