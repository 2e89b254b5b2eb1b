//! Coverage feedback: the shared bitmap backends write into, and the
//! bucketed novelty test the engine uses to decide what is interesting.

pub mod map;
pub mod trace;

pub use map::{SharedMap, MAP_SIZE};
pub use trace::{bucket, Trace};
