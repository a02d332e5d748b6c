//! Host-side execution of a reconstructed source tree: the shared workspace and
//! its scaffolding overlay, the compile stage, and the test stage.
//!
//! Every external tool runs as a child process under a wall-clock timeout, in
//! its own process group, with both output streams drained concurrently.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub mod compile;
pub mod junit;
pub mod process;
pub mod toolchain;
pub mod workspace;

pub use compile::{compile, parse_compiler_messages, CompileOutcome};
pub use junit::{
    discover_test_classes, parse_summary, register_logging_extension, run_tests, TestRunSummary,
    TestSelector,
};
pub use process::{run_with_wall_timeout, ChildOutput, ProcessLimits};
pub use toolchain::{classpath_jars, find_console_launcher, Toolchain};
pub use workspace::{OverlayMode, RunMarker, Workspace};

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("spawn {program}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("wait for {program}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} timed out after {} seconds", timeout.as_secs_f64())]
    Timeout { program: String, timeout: Duration },
    #[error("{}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
