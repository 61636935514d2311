//! # vmrent Common
//!
//! Shared utilities for the vmrent crates.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use vmrent_common::init_logging;
//!
//! init_logging("info").unwrap();
//! ```
//!
//! ## Timing
//!
//! [`TimedOperation`] measures how long a lifecycle operation took so the
//! duration can be attached to its audit record.

pub mod logging;
pub mod timing;

pub use logging::{init_logging, init_logging_json, init_logging_with_format, LogFormat};
pub use timing::TimedOperation;
