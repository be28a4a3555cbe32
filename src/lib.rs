//! Benchmark driver for TPC-H and TPC-DS queries whose result-producing
//! statement can be suspended inside a wall-clock window, checkpointed to
//! disk and later resumed to the same result an uninterrupted run returns.

pub mod config;
pub mod engine;
pub mod error;
pub mod materializer;
pub mod queries;
pub mod report;
pub mod session;
pub mod suspend;

pub use error::{RatchetError, Result};
