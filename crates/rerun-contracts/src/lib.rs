//! Shared, version-pinned layout identifiers.
//!
//! These constants are the single source of truth for the directory names, entry
//! prefixes, sentinel bodies and defaults that appear in the archives we read and
//! the files we write. The instrumented test scaffolding on the other side of the
//! pipeline hardcodes the same names, so changing one here is a format break.

pub const DIFF_INDEX_SCHEMA_VERSION: u32 = 1;

pub const ARCHIVES_DIR: &str = "archives";
pub const DIFF_INDEX_FILE: &str = "diff_index.json";
pub const PATCHES_INDEX_FILE: &str = "patches_index.jsonl";
pub const ENRICHED_RUNS_DIR: &str = "enriched_runs";
pub const DIFF_CACHE_DIR: &str = "diff_cache";
pub const SHARED_WORKSPACE_DIR: &str = "workspace_shared";

pub const DIFF_ARCHIVE_PREFIX: &str = "diffs";
pub const DIFF_ARCHIVE_SUFFIX: &str = ".tar.zip";
pub const DIFF_ARCHIVE_INNER_ENTRY: &str = "diffs";
pub const BASELINES_PREFIX: &str = "baselines/";
pub const PATCHES_PREFIX: &str = "patches/";

pub const PATCH_SENTINEL_FILE_CREATED: &str = "File created!";
pub const PATCH_SENTINEL_FILE_TOO_LARGE: &str = "File too large!";

pub const SOURCE_DIR: &str = "src";
pub const OUTPUT_DIR: &str = "bin";
pub const SCAFFOLD_PACKAGE: &str = "testSupport";
pub const RUN_MARKER_FILE: &str = "startTestRunInfo.json";
pub const SIDE_CHANNEL_LOG_FILE: &str = "run.tar";
pub const LOGGING_EXTENSION_CLASS: &str = "LoggingExtension.class";
pub const EXTENSION_SERVICE_FILE: &str = "META-INF/services/org.junit.jupiter.api.extension.Extension";

pub const TEST_RUN_INFO_ENTRY: &str = "testRunInfo.json";
pub const EVIDENCE_ENTRY_PREFIX: &str = "evidence/";

pub const SOURCE_EXTENSION: &str = ".java";
pub const CONSOLE_LAUNCHER_PREFIX: &str = "junit-platform-console-standalone";
pub const TEST_CLASS_SUFFIXES: &[&str] = &["Testing", "Test"];

pub const LOGGER_DISABLE_SIZE_CHECKS_PROPERTY: &str = "csse230.logger.disableSizeChecks";
pub const LOGGER_PREV_RUN_PROPERTY: &str = "csse230.logger.prevRunNumber";

pub const DEFAULT_JAVA_VERSION: u32 = 17;
pub const DEFAULT_COMPILE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 300;

/// A side-channel log smaller than one tar header block cannot hold a single entry.
pub const MIN_PLAUSIBLE_LOG_BYTES: u64 = 512;
