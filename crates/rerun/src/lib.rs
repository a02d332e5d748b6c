//! Replays a student project's logged history: rebuilds each run's source tree
//! from diff archives, compiles and tests it in a shared workspace, and
//! harvests per-test evidence into one enriched record set per run.

pub mod harvest;
pub mod materialize;
pub mod model;
pub mod orchestrator;

pub use harvest::{harvest, harvest_and_copy, read_log, HarvestError, HarvestOutcome};
pub use materialize::{
    file_key_to_relative_path, MaterializeReport, PatchSet, ReconstructError, SelectionMode,
    SnapshotMaterializer,
};
pub use model::{BatchReport, EnrichedTestResult, RunOutcome, RunStatusKind, TestStatus};
pub use orchestrator::{run_batch, BatchAbort, RerunOptions, RunState};
