//! Backends launch one instrumented execution of the target and report back
//! a coverage [`Trace`], or a hang.

pub mod fork_server;
pub mod trace_parse;

use std::time::Duration;

pub use fork_server::{ForkServerBackend, ForkServerConfig};
pub use trace_parse::{TraceParseBackend, TraceParseConfig};

use crate::coverage::Trace;
use crate::error::Result;

/// Result of one execution. A hang is not an error: it's a distinct, expected
/// outcome the engine's classification logic consumes directly.
#[derive(Debug)]
pub enum Outcome {
    Completed(Trace),
    Hanged,
}

/// A tagged union over the two backend implementations, so the engine can
/// hold whichever one the CLI selected without a trait object.
#[derive(Debug)]
pub enum Backend {
    ForkServer(ForkServerBackend),
    TraceParse(TraceParseBackend),
}

impl Backend {
    /// Run `payload` through the target once and classify the result.
    pub fn run(&mut self, payload: &[u8], timeout: Duration) -> Result<Outcome> {
        match self {
            Backend::ForkServer(b) => b.run(payload, timeout),
            Backend::TraceParse(b) => b.run(payload, timeout),
        }
    }

    /// Release every scoped resource the backend holds. Idempotent.
    pub fn cleanup(&mut self) {
        match self {
            Backend::ForkServer(b) => b.cleanup(),
            Backend::TraceParse(b) => b.cleanup(),
        }
    }
}
