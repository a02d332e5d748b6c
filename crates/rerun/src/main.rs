use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use rerun::{run_batch, RerunOptions};
use rerun_archive::{index_dir, write_index};
use rerun_contracts::{
    ARCHIVES_DIR, DEFAULT_COMPILE_TIMEOUT_SECS, DEFAULT_JAVA_VERSION, DEFAULT_TEST_TIMEOUT_SECS,
};
use rerun_host_runner::TestSelector;

/// Replays logged test runs from diff archives.
#[derive(Parser, Debug)]
#[command(name = "rerun")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index `<input>/archives` into `diff_index.json` and `patches_index.jsonl`.
    Index(IndexArgs),
    /// Rebuild, compile, test and harvest every selected run.
    Replay(ReplayArgs),
}

#[derive(Args, Debug)]
struct IndexArgs {
    /// Directory holding `archives/`
    #[arg(long)]
    input: PathBuf,

    /// Where to write the index files (defaults to the input directory)
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// Directory holding `archives/` and `patches_index.jsonl`
    #[arg(long)]
    input: PathBuf,

    #[arg(long)]
    out: PathBuf,

    /// Directory of classpath jars, including the console launcher
    #[arg(long)]
    deps: PathBuf,

    /// Scratch directory (defaults to `<out>/work`)
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Scaffolding sources copied into `src/testSupport`
    #[arg(long)]
    test_support: Option<PathBuf>,

    #[arg(long)]
    java_home: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_JAVA_VERSION)]
    java_version: u32,

    /// Replay only this run (or the nearest earlier one)
    #[arg(long)]
    run: Option<u32>,

    /// `Class` or `Class#method`
    #[arg(long)]
    test: Option<String>,

    #[arg(long)]
    keep_work_dir: bool,

    #[arg(long, default_value_t = DEFAULT_COMPILE_TIMEOUT_SECS)]
    compile_timeout_secs: u64,

    #[arg(long, default_value_t = DEFAULT_TEST_TIMEOUT_SECS)]
    test_timeout_secs: u64,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Index(args) => cmd_index(args),
        Command::Replay(args) => cmd_replay(args),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize report")?;
    println!("{text}");
    Ok(())
}

fn cmd_index(args: IndexArgs) -> Result<ExitCode> {
    let archives = args.input.join(ARCHIVES_DIR);
    let index = index_dir(&archives).with_context(|| format!("index {}", archives.display()))?;
    let out = args.out.unwrap_or(args.input);
    write_index(&index, &out)?;
    for w in &index.warnings {
        tracing::warn!("{w}");
    }
    print_json(&serde_json::json!({
        "archives": index.archives.len(),
        "patches": index.pointers.len(),
        "warnings": index.warnings,
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_replay(args: ReplayArgs) -> Result<ExitCode> {
    let mut options = RerunOptions::new(args.input, args.out, args.deps)
        .with_overlay_dir(args.test_support)
        .with_java_home(args.java_home)
        .with_java_version(args.java_version)
        .with_run(args.run)
        .with_test(args.test.as_deref().and_then(TestSelector::parse))
        .keep_work_dir(args.keep_work_dir)
        .with_compile_timeout(Duration::from_secs(args.compile_timeout_secs))
        .with_test_timeout(Duration::from_secs(args.test_timeout_secs));
    if let Some(dir) = args.work_dir {
        options = options.with_work_dir(dir);
    }

    let report = run_batch(&options)?;
    print_json(&serde_json::json!({
        "runsProcessed": report.runs_processed,
        "runsCompiled": report.runs_compiled,
        "runsExecuted": report.runs_executed,
        "totalTestsFound": report.total_tests_found,
        "totalTestsPassed": report.total_tests_passed,
        "totalTestsFailed": report.total_tests_failed,
        "runsWithResults": report.results_by_run.keys().collect::<Vec<_>>(),
        "warnings": report.warnings,
        "errors": report.errors,
    }))?;
    Ok(if report.has_errors() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}
