//! Shared utilities for lingo.
//!
//! This crate provides common utilities used across the lingo workspace:
//! - Logging setup with tracing
//! - RAII-based timing for operation measurement

pub mod log;
pub mod timing;

pub use log::{LogConfig, LogLevel};
pub use timing::TimingGuard;
