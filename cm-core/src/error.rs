//! Error types for cachemark core
//!
//! Re-exports the unified error type from cm-error.

pub use cm_error::{CacheMarkError, Result};
