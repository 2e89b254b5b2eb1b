use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use edgefuzz::backend::{Backend, ForkServerBackend, ForkServerConfig, TraceParseBackend, TraceParseConfig};
use edgefuzz::engine::{EngineConfig, FuzzerEngine};
use edgefuzz::testcase::TestCase;
use edgefuzz::EdgeFuzzError;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, clap::Parser)]
#[command(version, about, styles = clap::builder::Styles::styled())]
pub struct Cli {
    /// Path to the target executable under test.
    target: PathBuf,

    /// Extra arguments forwarded to the target, after `--`.
    #[arg(last = true)]
    target_args: Vec<OsString>,

    /// Run the target under the fork-server backend (e.g. AFL-instrumented QEMU).
    #[arg(long)]
    qemu: bool,

    /// Run the target under the trace-parse backend (e.g. a Valgrind tool
    /// emitting `SB <addr>` superblock records on stderr).
    #[arg(long)]
    valgrind: bool,

    /// Directory of seed inputs, loaded non-recursively.
    #[arg(long)]
    seeds: PathBuf,

    /// Output directory for crashing inputs.
    #[arg(long, default_value = "output")]
    output: PathBuf,

    #[arg(short, long)]
    verbose: bool,

    /// Per-execution timeout in milliseconds; 0 disables hang detection.
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Minimum interval between stats-line redraws, in milliseconds.
    #[arg(long, default_value_t = 500)]
    stats_interval_ms: u64,
}

#[derive(Debug, Clone, Copy)]
enum BackendKind {
    Qemu,
    Valgrind,
}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        setup_logger(self.verbose).context("setting up logger")?;

        let backend_kind = self.backend_kind()?;
        let seeds = load_seeds(&self.seeds)?;
        info!(count = seeds.len(), seeds = %self.seeds.display(), "loaded seed corpus");

        let backend = match backend_kind {
            BackendKind::Qemu => {
                let config = ForkServerConfig::new(self.target.clone(), self.target_args.clone());
                Backend::ForkServer(
                    ForkServerBackend::new(config).context("starting fork-server backend")?,
                )
            }
            BackendKind::Valgrind => {
                let config = TraceParseConfig::new(self.target.clone(), self.target_args.clone());
                Backend::TraceParse(
                    TraceParseBackend::new(config).context("starting trace-parse backend")?,
                )
            }
        };

        let engine_config = EngineConfig {
            output_dir: self.output.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            stats_interval: Duration::from_millis(self.stats_interval_ms),
        };
        let mut engine = FuzzerEngine::new(backend, seeds, engine_config);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let handler_flag = Arc::clone(&stop_flag);
        ctrlc::set_handler(move || {
            handler_flag.store(true, Ordering::Relaxed);
        })
        .context("installing Ctrl-C handler")?;

        engine.run(&stop_flag).context("running fuzzer engine")?;

        info!(
            executions = engine.executions(),
            crashes = engine.crashes(),
            paths = engine.paths(),
            "run finished"
        );
        Ok(())
    }

    fn backend_kind(&self) -> anyhow::Result<BackendKind> {
        match (self.qemu, self.valgrind) {
            (true, false) => Ok(BackendKind::Qemu),
            (false, true) => Ok(BackendKind::Valgrind),
            (false, false) => bail!("one of --qemu or --valgrind must be given"),
            (true, true) => bail!("--qemu and --valgrind are mutually exclusive"),
        }
    }
}

fn setup_logger(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_timer(fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_owned()))
                // Keep stdout free for the engine's self-overwriting stats line.
                .with_writer(std::io::stderr),
        )
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env()
                .context("constructing log filter from env")?,
        )
        .init();
    Ok(())
}

/// Enumerates regular files directly under `dir`, sorted by name, and loads
/// each as an initial test case. Non-recursive; an empty or missing
/// directory is a configuration error.
fn load_seeds(dir: &Path) -> anyhow::Result<Vec<TestCase>> {
    if !dir.is_dir() {
        return Err(EdgeFuzzError::SeedDirectoryMissing {
            path: dir.to_path_buf(),
        }
        .into());
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("reading seed directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(EdgeFuzzError::NoSeeds {
            path: dir.to_path_buf(),
        }
        .into());
    }

    paths
        .into_iter()
        .map(|path| TestCase::load_from(&path).map_err(Into::into))
        .collect()
}
