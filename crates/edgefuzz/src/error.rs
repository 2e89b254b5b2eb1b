//! Typed error taxonomy for the fuzzer core.
//!
//! Per-execution outcomes (crash, hang) are *not* represented here: they are
//! data produced by a backend and consumed by the engine's classification
//! logic, never propagated as errors. Only process-wide failures that should
//! abort a run live in this enum.

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, EdgeFuzzError>;

#[derive(Debug, thiserror::Error)]
pub enum EdgeFuzzError {
    #[error("seed directory {path:?} does not exist or is not a directory")]
    SeedDirectoryMissing { path: PathBuf },

    #[error("seed directory {path:?} contains no files")]
    NoSeeds { path: PathBuf },

    #[error("fork server exited before completing the handshake: {0}")]
    PrematureForkServerExit(String),

    #[error("fork server protocol violation: {0}")]
    Protocol(String),

    #[error("I/O failure talking to the target: {0}")]
    Io(#[from] io::Error),

    #[error("failed system call: {0}")]
    Errno(#[from] nix::errno::Errno),
}
