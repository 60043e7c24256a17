//! # xfer – Transfer Engine
//!
//! Protocol-agnostic engine for large, resumable file transfers:
//!   • Fresh-vs-resume decisions derived from observed file sizes
//!   • Lock markers that refuse overlapping transfers and survive crashes
//!   • Lock-free progress counters with instantaneous & average rates
//!   • Chunked, strictly ordered copy loop with cooperative abort
//!   • Blocking `run()` plus a tokio worker wrapper
//!   • Optional SHA-256 verification of the finished file

pub mod engine;

pub use engine::*;
