//! # virtkit Common
//!
//! Shared utilities for the virtkit components.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use virtkit_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(vm = "web01", "VM started");
//! ```

pub mod logging;

// Re-export logging functions
pub use logging::{init_logging, init_logging_json};
