//! Error Handling Module
//!
//! - Core error type (`ComposeError`) and its category (`ErrorCategory`)
//! - Type conversions from runtime errors
//!
//! # Example
//!
//! ```rust,ignore
//! use streamsplice::error::{ComposeError, ErrorCategory};
//!
//! let error = ComposeError::stage("parse failure");
//! assert_eq!(error.category(), ErrorCategory::Stage);
//! assert!(!error.is_recoverable());
//! ```

mod conversions;
pub mod types;

pub use types::*;
