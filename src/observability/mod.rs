//! Observability for the subscriber - structured logging and session metrics
//!
//! Logging goes through `tracing` with a configurable subscriber; metrics are
//! lock-free counters owned by each session.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{MetricsSnapshot, SessionMetrics};

// Span macros for structured logging
pub use logging::{mqtt_span, store_span};
