//! Utility modules
//!
//! - [`durable`]: Atomic temp-file-then-rename writes with bounded retries

pub mod durable;

pub use durable::{retry_with_backoff, write_atomic, write_durable, RetryPolicy};
