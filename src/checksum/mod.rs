//! Transfer checksum computation
//!
//! Provides the rolling, restartable checksum used by the file transfer
//! protocol to validate resumed and completed files.

mod algorithm;
mod engine;

pub use algorithm::*;
pub use engine::*;
