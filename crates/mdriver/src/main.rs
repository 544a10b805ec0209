use std::{
    fs,
    path::{Path, PathBuf},
    process,
};

use argh::FromArgs;
use mdriver::{
    debug, info,
    log::{self, LogLevel},
    replay::{self, ReplayConfig, ReplayStats},
    report::{GenericError, Report},
    trace::Trace,
};
use snafu::{ResultExt as _, ensure_whatever};
use tagalloc::{HeapConfig, ReservedArena};

/// Replays allocation traces against a tagalloc heap and reports space
/// utilization.
#[derive(Debug, FromArgs)]
struct Args {
    /// trace files to replay; defaults to the bundled traces
    #[argh(positional)]
    traces: Vec<PathBuf>,

    /// run the heap checker after every request
    #[argh(switch, short = 'c')]
    check: bool,

    /// log every request
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// only log warnings and errors
    #[argh(switch, short = 'q')]
    quiet: bool,

    /// bytes reserved for each trace's arena
    #[argh(option, default = "ReservedArena::DEFAULT_CAPACITY")]
    capacity: usize,

    /// initial heap size and minimum growth, in bytes
    #[argh(option, default = "HeapConfig::DEFAULT_CHUNK")]
    chunk: usize,
}

fn main() {
    let args: Args = argh::from_env();

    if let Err(err) = run(&args) {
        let report = Report::new(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), GenericError> {
    ensure_whatever!(
        !(args.verbose && args.quiet),
        "--verbose and --quiet are mutually exclusive"
    );
    log::set_max_level(if args.verbose {
        LogLevel::Trace
    } else if args.quiet {
        LogLevel::Warn
    } else {
        LogLevel::Info
    });

    let paths = if args.traces.is_empty() {
        bundled_traces()?
    } else {
        args.traces.clone()
    };
    ensure_whatever!(!paths.is_empty(), "no traces to replay");

    let config = ReplayConfig {
        capacity: args.capacity,
        chunk: args.chunk,
        check: args.check,
    };
    debug!("{config:?}");

    println!(
        "{:<24} {:>8} {:>10} {:>10} {:>6} {:>10}",
        "trace", "ops", "peak", "arena", "util", "Kops/s"
    );
    let mut total_utilization = 0.0;
    for path in &paths {
        let stats = replay_file(path, &config)
            .with_whatever_context(|_| format!("trace {} failed", path.display()))?;
        print_row(path, &stats);
        total_utilization += stats.utilization();
    }

    #[expect(clippy::cast_precision_loss)]
    let average = total_utilization / paths.len() as f64;
    println!("average utilization: {:.1}%", average * 100.0);
    Ok(())
}

fn bundled_traces() -> Result<Vec<PathBuf>, GenericError> {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("traces");
    let entries = fs::read_dir(&dir).with_whatever_context(|_| {
        format!("failed to list bundled traces in {}", dir.display())
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .whatever_context("failed to list bundled traces")?
            .path();
        if path.extension().is_some_and(|ext| ext == "rep") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn replay_file(path: &Path, config: &ReplayConfig) -> Result<ReplayStats, GenericError> {
    let trace = Trace::load(path).whatever_context("failed to load trace")?;
    info!(
        "replaying {} ({} requests, {} ids)",
        path.display(),
        trace.steps().len(),
        trace.id_count()
    );
    let stats = replay::replay(&trace, config).whatever_context("replay failed")?;
    Ok(stats)
}

fn print_row(path: &Path, stats: &ReplayStats) {
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());
    println!(
        "{:<24} {:>8} {:>10} {:>10} {:>5.1}% {:>10.1}",
        name,
        stats.ops,
        stats.peak_payload,
        stats.arena_size,
        stats.utilization() * 100.0,
        stats.throughput() / 1000.0
    );
}
