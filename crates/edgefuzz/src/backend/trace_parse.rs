//! Trace-parse backend: runs the target fresh under a dynamic-translation
//! tool that emits `SB <hex-address>` superblock records on stderr, and
//! synthesizes a coverage map from them with the AFL edge-hash.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use derive_new::new as New;
use tracing::{debug, warn};

use super::Outcome;
use crate::coverage::{Trace, MAP_SIZE};
use crate::error::Result;

/// How often the wait loop polls the child for exit while a timeout is in
/// effect.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, New)]
pub struct TraceParseConfig {
    pub target: PathBuf,
    pub args: Vec<OsString>,
}

#[derive(Debug)]
pub struct TraceParseBackend {
    config: TraceParseConfig,
}

impl TraceParseBackend {
    pub fn new(config: TraceParseConfig) -> Result<Self> {
        Ok(Self { config })
    }

    pub fn run(&mut self, payload: &[u8], timeout: Duration) -> Result<Outcome> {
        let mut child = Command::new(&self.config.target)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // Best-effort: a target that exits before reading all of stdin
            // (e.g. it crashes immediately) makes this a broken-pipe error,
            // which is not itself a fuzzer failure.
            let _ = stdin.write_all(payload);
        }

        let start = Instant::now();
        if wait_with_timeout(&mut child, timeout)?.is_none() {
            kill_and_reap(&mut child);
            return Ok(Outcome::Hanged);
        }
        let duration = start.elapsed();

        let status = child.wait()?;
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr)?;
        }

        let map = build_map(&stderr);

        let (did_crash, exit_signal, exit_code) = match status.signal() {
            Some(sig) => (true, sig as u8, 0),
            None => (false, 0, status.code().unwrap_or(0) as u8),
        };

        let trace = Trace::new(map, did_crash, exit_signal, exit_code, duration);
        Ok(Outcome::Completed(trace))
    }

    pub fn cleanup(&mut self) {
        // Every execution is a fresh, already-reaped child; nothing to hold.
    }
}

/// Polls `child` for exit until `timeout` elapses (0 meaning no timeout).
/// Returns `Some(())` once the child has exited, `None` on timeout.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Option<()>> {
    if timeout.is_zero() {
        // Blocking wait with no deadline; the caller accepted this risk by
        // configuring timeout 0.
        loop {
            if child.try_wait()?.is_some() {
                return Ok(Some(()));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    let deadline = Instant::now() + timeout;
    loop {
        if child.try_wait()?.is_some() {
            return Ok(Some(()));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn kill_and_reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        warn!(%err, "failed to kill hung target under trace-parse backend");
    }
    let _ = child.wait();
}

/// Builds a synthetic coverage map from `SB <hex-addr>` lines, applying the
/// AFL edge-hash to turn a sequence of superblock addresses into map hits.
fn build_map(stderr: &str) -> Box<[u8]> {
    let mut map = vec![0u8; MAP_SIZE];
    let mut prev: u64 = 0;

    for line in stderr.lines() {
        let Some(addr) = parse_superblock_line(line) else {
            continue;
        };
        let cur = ((addr >> 4) ^ (addr << 8)) & (MAP_SIZE as u64 - 1);
        let idx = (cur ^ prev) as usize;
        map[idx] = map[idx].saturating_add(1);
        prev = cur >> 1;
    }

    debug!(lines = stderr.lines().count(), "parsed trace-parse stderr");
    map.into_boxed_slice()
}

/// Parses a `SB <hex-addr>` line (case-insensitive prefix), returning the
/// address. Any line not matching this shape is ignored.
fn parse_superblock_line(line: &str) -> Option<u64> {
    let line = line.trim();
    let rest = line
        .strip_prefix("SB ")
        .or_else(|| line.strip_prefix("sb "))
        .or_else(|| line.strip_prefix("Sb "))
        .or_else(|| line.strip_prefix("sB "))?;
    u64::from_str_radix(rest.trim(), 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_superblock_line() {
        assert_eq!(parse_superblock_line("SB 1000"), Some(0x1000));
        assert_eq!(parse_superblock_line("sb DEAD"), Some(0xDEAD));
    }

    #[test]
    fn ignores_unrelated_lines() {
        assert_eq!(parse_superblock_line("hello world"), None);
        assert_eq!(parse_superblock_line(""), None);
        assert_eq!(parse_superblock_line("SBxyz"), None);
    }

    #[test]
    fn matches_the_worked_edge_hash_example() {
        // "SB 1000\nSB 2000\nSB 1000\n": three records, exactly three map
        // cells should have nonzero counts (or fewer, if hashes collide).
        let stderr = "SB 1000\nSB 2000\nSB 1000\n";
        let map = build_map(stderr);
        let total: u32 = map.iter().map(|&b| u32::from(b)).sum();
        assert_eq!(total, 3);

        // Reproduce the formula by hand for the first record to pin the
        // exact bit-twiddling, independent of the loop above.
        let addr: u64 = 0x1000;
        let cur = ((addr >> 4) ^ (addr << 8)) & (MAP_SIZE as u64 - 1);
        assert_eq!(cur, 0x80);
        let prev_after = cur >> 1;
        assert_eq!(prev_after, 0x40);
    }

    #[test]
    fn unrelated_lines_are_ignored_entirely() {
        let stderr = "garbage\nSB 10\nmore garbage\n";
        let map = build_map(stderr);
        let total: u32 = map.iter().map(|&b| u32::from(b)).sum();
        assert_eq!(total, 1);
    }
}
