//! Built-in effects used by the CLI and the test suites.
//!
//! These are deliberately small: the interesting machinery lives in the
//! evaluator and scheduler, and these nodes exist to exercise it.

mod filters;
mod generators;
mod time;
mod writers;

pub use filters::{BoxBlur, Gain, Translate2D};
pub use generators::{AuxVectors, SolidColor};
pub use time::{FrameHold, TimeOffset};
pub use writers::{DiskCacheNode, SequenceEvent, WriteSink};
