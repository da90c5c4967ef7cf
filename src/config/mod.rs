//! Configuration module for the rendezvous engine
//!
//! Provides configuration management including CLI arguments,
//! config files, proxy policy and strategy deadlines.

mod settings;

pub use settings::*;
