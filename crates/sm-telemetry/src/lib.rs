//! Logging setup for smithy processes.
//!
//! Human-readable or JSON output via `tracing-subscriber`, filtered by
//! `RUST_LOG` or the configured level.

pub mod logging;

pub use logging::{init_from_config, init_logging, init_logging_json};
