//! Error types and the structured error taxonomy.
//!
//! [`DataForgeError`] is the single error enum surfaced by every component.
//! [`taxonomy`] turns any failure into a categorized [`ErrorReport`] with a
//! stable code, severity, category and remediation suggestions, and decides
//! which codes are retryable.

mod taxonomy;
mod types;

pub use taxonomy::{classify, classify_message, is_retryable, Category, ErrorReport, Severity};
pub use types::DataForgeError;
