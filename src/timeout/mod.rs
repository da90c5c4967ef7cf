//! Timeout service
//!
//! One timer thread per connection manager; strategies register a deadline
//! when they start and the engine pauses, resumes or disarms it.

mod service;

pub use service::*;
