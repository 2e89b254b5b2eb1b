//! The fuzzer engine: drives strategies against the backend, classifies
//! traces, persists crashes, and renders a live status line.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::backend::{Backend, Outcome};
use crate::coverage::Trace;
use crate::error::Result;
use crate::strategy::Strategy;
use crate::testcase::TestCase;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub output_dir: PathBuf,
    /// Per-execution timeout; zero disables hang detection.
    pub timeout: Duration,
    /// Minimum time between redraws of the stats line.
    pub stats_interval: Duration,
}

/// Coordinates the strategy queue, the backend, and coverage bookkeeping.
///
/// Single-threaded and strictly serial by design: at most one backend
/// execution is outstanding at a time, and cancellation is cooperative via a
/// stop flag checked at the top of every iteration.
#[derive(Debug)]
pub struct FuzzerEngine {
    backend: Backend,
    input_queue: VecDeque<TestCase>,
    strategy_queue: VecDeque<Strategy>,
    current_strategy: Option<Strategy>,
    baseline: Option<Trace>,
    output_dir: PathBuf,
    timeout: Duration,
    stats_interval: Duration,
    executions: u64,
    crashes: u64,
    start: Instant,
    last_new_path: Instant,
    last_crash: Option<Instant>,
    last_stats_render: Instant,
}

impl FuzzerEngine {
    pub fn new(backend: Backend, seeds: Vec<TestCase>, config: EngineConfig) -> Self {
        debug_assert!(!seeds.is_empty(), "engine requires at least one seed");
        let now = Instant::now();
        Self {
            backend,
            input_queue: seeds.into(),
            strategy_queue: VecDeque::new(),
            current_strategy: None,
            baseline: None,
            output_dir: config.output_dir,
            timeout: config.timeout,
            stats_interval: config.stats_interval,
            executions: 0,
            crashes: 0,
            start: now,
            last_new_path: now,
            last_crash: None,
            last_stats_render: now,
        }
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn crashes(&self) -> u64 {
        self.crashes
    }

    pub fn paths(&self) -> usize {
        self.baseline.as_ref().map(Trace::number_of_paths).unwrap_or(0)
    }

    /// Runs until both queues drain naturally or `stop_flag` is observed.
    /// Always invokes backend cleanup before returning, on every exit path.
    pub fn run(&mut self, stop_flag: &AtomicBool) -> Result<()> {
        let result = self.run_inner(stop_flag);
        self.backend.cleanup();
        println!();
        result
    }

    fn run_inner(&mut self, stop_flag: &AtomicBool) -> Result<()> {
        loop {
            if stop_flag.load(Ordering::Relaxed) {
                info!("stop requested, finishing current iteration and exiting");
                return Ok(());
            }

            if self.current_strategy.is_none() {
                if self.strategy_queue.is_empty() {
                    let Some(seed) = self.input_queue.pop_front() else {
                        info!(
                            executions = self.executions,
                            crashes = self.crashes,
                            "input queue and strategy queue empty, ending run"
                        );
                        return Ok(());
                    };
                    self.strategy_queue = Strategy::all_for(&seed).into();
                }
                self.current_strategy = self.strategy_queue.pop_front();
            }

            let Some(strategy) = self.current_strategy.as_mut() else {
                continue;
            };

            match strategy.gen_test() {
                None => {
                    self.current_strategy = None;
                }
                Some(case) => {
                    self.execute(case)?;
                    self.render_stats();
                }
            }
        }
    }

    fn execute(&mut self, case: TestCase) -> Result<()> {
        let outcome = self.backend.run(&case.data, self.timeout)?;
        self.executions += 1;

        let trace = match outcome {
            Outcome::Hanged => {
                warn!(name = %case.name, "execution hung, child killed");
                return Ok(());
            }
            Outcome::Completed(trace) => trace,
        };

        if self.baseline.is_none() {
            self.baseline = Some(trace.clone());
        }

        if trace.did_crash {
            self.crashes += 1;
            self.persist_crash(&case)?;
            self.last_crash = Some(Instant::now());
        } else {
            let is_interesting = {
                let baseline = self.baseline.as_ref().expect("baseline set above");
                trace.compare_to(baseline)
            };
            if is_interesting {
                self.input_queue.push_back(case);
            }
        }

        let baseline = self.baseline.as_mut().expect("baseline set above");
        let paths_before = baseline.number_of_paths();
        trace.combine_into(baseline);
        if baseline.number_of_paths() > paths_before {
            self.last_new_path = Instant::now();
        }

        Ok(())
    }

    fn persist_crash(&mut self, case: &TestCase) -> Result<()> {
        fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(format!("input_{}", self.crashes));
        case.write_to(&path)?;
        info!(path = %path.display(), crash_ordinal = self.crashes, "persisted crashing input");
        Ok(())
    }

    fn render_stats(&mut self) {
        if self.last_stats_render.elapsed() < self.stats_interval {
            return;
        }
        self.last_stats_render = Instant::now();

        let (strategy_name, strategy_pct) = self
            .current_strategy
            .as_ref()
            .map(|s| {
                let stats = s.stats();
                (stats.name, stats.percent_complete)
            })
            .unwrap_or(("-", 0));

        print!(
            "\relapsed {:>6}s execs {:>8} paths {:>5} (+{:>4}s) crashes {:>4}{} queue {:>4}/{:>3} {} {:>3}%   ",
            self.start.elapsed().as_secs(),
            self.executions,
            self.paths(),
            self.last_new_path.elapsed().as_secs(),
            self.crashes,
            self.last_crash
                .map(|t| format!(" (+{}s)", t.elapsed().as_secs()))
                .unwrap_or_default(),
            self.input_queue.len(),
            self.strategy_queue.len(),
            strategy_name,
            strategy_pct,
        );
        let _ = io::stdout().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, TraceParseBackend, TraceParseConfig};

    fn engine_with_target(script: &str) -> FuzzerEngine {
        let config = TraceParseConfig::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".into(), script.into()],
        );
        let backend = Backend::TraceParse(TraceParseBackend::new(config).unwrap());
        let seeds = vec![TestCase::new(b"seed".to_vec(), "seed")];
        let output_dir = tempfile::tempdir().unwrap().keep();
        FuzzerEngine::new(
            backend,
            seeds,
            EngineConfig {
                output_dir,
                timeout: Duration::from_secs(2),
                stats_interval: Duration::from_secs(3600),
            },
        )
    }

    #[test]
    fn clean_target_with_no_coverage_never_crashes() {
        let mut engine = engine_with_target("cat >/dev/null");
        let stop = AtomicBool::new(false);
        engine.run(&stop).unwrap();
        assert_eq!(engine.crashes(), 0);
        assert_eq!(engine.paths(), 0);
        assert!(engine.executions() > 0);
    }

    #[test]
    fn target_that_always_segfaults_persists_the_first_crash() {
        let mut engine = engine_with_target("cat >/dev/null; kill -SEGV $$");
        let stop = AtomicBool::new(false);
        engine.run(&stop).unwrap();
        assert!(engine.crashes() >= 1);
        assert!(engine.output_dir.join("input_1").exists());
    }

    #[test]
    fn stop_flag_halts_the_run_promptly() {
        let mut engine = engine_with_target("cat >/dev/null");
        let stop = AtomicBool::new(true);
        engine.run(&stop).unwrap();
        assert_eq!(engine.executions(), 0);
    }
}
