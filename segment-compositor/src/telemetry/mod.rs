//! Telemetry and logging infrastructure
//!
//! Structured logging with tracing and render-time statistics.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogConfig, LogGuard};
pub use metrics::{RenderProfiler, RenderStats};
