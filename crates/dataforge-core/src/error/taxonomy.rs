//! Categorized error reports.
//!
//! Every failure surfaced to users is reduced to an [`ErrorReport`] with a
//! stable `code`, a severity, a category and remediation suggestions.
//! Matching is case-insensitive and substring-based over the error message;
//! typed [`DataForgeError`] variants map directly to their codes first.
//! Unmatched errors fall back to `UNKNOWN` (medium / system).

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use super::DataForgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Connection,
    Validation,
    Permission,
    Data,
    System,
    Network,
}

/// A categorized, user-facing description of a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    pub severity: Severity,
    pub category: Category,
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical_details: Option<String>,
}

struct Rule {
    needle: &'static str,
    code: &'static str,
    severity: Severity,
    category: Category,
    suggestions: &'static [&'static str],
}

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        Rule {
            needle: "connection refused",
            code: "CONNECTION_REFUSED",
            severity: Severity::High,
            category: Category::Connection,
            suggestions: &[
                "Verify the target host and port are correct",
                "Check that the remote service is running and reachable",
            ],
        },
        Rule {
            needle: "access denied",
            code: "ACCESS_DENIED",
            severity: Severity::High,
            category: Category::Permission,
            suggestions: &["Check credentials and filesystem permissions"],
        },
        Rule {
            needle: "permission denied",
            code: "ACCESS_DENIED",
            severity: Severity::High,
            category: Category::Permission,
            suggestions: &["Check credentials and filesystem permissions"],
        },
        Rule {
            needle: "no such database",
            code: "DATABASE_NOT_FOUND",
            severity: Severity::Medium,
            category: Category::Connection,
            suggestions: &["Verify the store path; it is created on first write"],
        },
        Rule {
            needle: "unable to open database",
            code: "DATABASE_NOT_FOUND",
            severity: Severity::Medium,
            category: Category::Connection,
            suggestions: &["Verify the store path; it is created on first write"],
        },
        Rule {
            needle: "invalid file format",
            code: "INVALID_FILE_FORMAT",
            severity: Severity::Medium,
            category: Category::Validation,
            suggestions: &[
                "Confirm the file matches the configured provider type",
                "Check delimiter and header settings for delimited files",
            ],
        },
        Rule {
            needle: "missing required field",
            code: "MISSING_REQUIRED_FIELD",
            severity: Severity::Medium,
            category: Category::Validation,
            suggestions: &["Add the missing field or relax the source schema"],
        },
        Rule {
            needle: "rate limit",
            code: "API_RATE_LIMIT",
            severity: Severity::Medium,
            category: Category::Network,
            suggestions: &["Reduce the sync frequency or request a higher quota"],
        },
        Rule {
            needle: "too many requests",
            code: "API_RATE_LIMIT",
            severity: Severity::Medium,
            category: Category::Network,
            suggestions: &["Reduce the sync frequency or request a higher quota"],
        },
        Rule {
            needle: "unauthorized",
            code: "API_UNAUTHORIZED",
            severity: Severity::High,
            category: Category::Permission,
            suggestions: &["Refresh the API credentials configured for this source"],
        },
        Rule {
            needle: "timeout",
            code: "NETWORK_TIMEOUT",
            severity: Severity::Medium,
            category: Category::Network,
            suggestions: &[
                "Increase the provider timeout",
                "Check network connectivity to the remote host",
            ],
        },
        Rule {
            needle: "timed out",
            code: "NETWORK_TIMEOUT",
            severity: Severity::Medium,
            category: Category::Network,
            suggestions: &["Increase the provider timeout"],
        },
        Rule {
            needle: "out of memory",
            code: "INSUFFICIENT_MEMORY",
            severity: Severity::High,
            category: Category::System,
            suggestions: &["Reduce batch sizes or increase available memory"],
        },
        Rule {
            needle: "no space left",
            code: "DISK_SPACE_LOW",
            severity: Severity::High,
            category: Category::System,
            suggestions: &["Free disk space or tighten the retention policy"],
        },
        Rule {
            needle: "disk full",
            code: "DISK_SPACE_LOW",
            severity: Severity::High,
            category: Category::System,
            suggestions: &["Free disk space or tighten the retention policy"],
        },
        Rule {
            needle: "corrupt",
            code: "DATA_CORRUPTION",
            severity: Severity::Critical,
            category: Category::Data,
            suggestions: &[
                "Restore the store file from the most recent backup",
                "Run an integrity check on the affected store",
            ],
        },
        Rule {
            needle: "malformed",
            code: "DATA_CORRUPTION",
            severity: Severity::Critical,
            category: Category::Data,
            suggestions: &["Restore the store file from the most recent backup"],
        },
        Rule {
            needle: "schema mismatch",
            code: "SCHEMA_MISMATCH",
            severity: Severity::Medium,
            category: Category::Data,
            suggestions: &["Review the source schema history for the breaking change"],
        },
    ]
});

/// Codes that may be retried with backoff.
const RETRYABLE: &[&str] = &["NETWORK_TIMEOUT", "API_RATE_LIMIT", "CONNECTION_REFUSED"];

pub fn is_retryable(code: &str) -> bool {
    RETRYABLE.contains(&code)
}

/// Classify a typed error. Engine-specific variants map directly to their
/// codes; everything else goes through message matching.
pub fn classify(error: &DataForgeError) -> ErrorReport {
    let message = error.to_string();
    match error {
        DataForgeError::CyclicPipeline { .. } => report(
            "CYCLIC_PIPELINE",
            &message,
            Severity::Medium,
            Category::Validation,
            vec!["Remove the circular edge from the pipeline graph".into()],
        ),
        DataForgeError::ExpiredRollbackPoint { .. } => report(
            "EXPIRED_ROLLBACK_POINT",
            &message,
            Severity::Medium,
            Category::Data,
            vec!["Create a fresh rollback point; retention removed a referenced version".into()],
        ),
        DataForgeError::UnsupportedFeature { .. } => report(
            "UNSUPPORTED_FEATURE",
            &message,
            Severity::Low,
            Category::Validation,
            vec!["Choose a delta mode or provider capability this source supports".into()],
        ),
        DataForgeError::Cancelled => report(
            "CANCELLED_BY_USER",
            &message,
            Severity::Low,
            Category::System,
            vec![],
        ),
        DataForgeError::NetworkTimeout { .. } => report(
            "NETWORK_TIMEOUT",
            &message,
            Severity::Medium,
            Category::Network,
            vec!["Increase the provider timeout".into()],
        ),
        DataForgeError::InvalidFileFormat { .. } => report(
            "INVALID_FILE_FORMAT",
            &message,
            Severity::Medium,
            Category::Validation,
            vec!["Confirm the file matches the configured provider type".into()],
        ),
        DataForgeError::SchemaMismatch { .. } => report(
            "SCHEMA_MISMATCH",
            &message,
            Severity::Medium,
            Category::Data,
            vec!["Review the source schema history for the breaking change".into()],
        ),
        _ => classify_message(&message),
    }
}

/// Substring classification over a raw message. Case-insensitive; the first
/// matching rule wins; unmatched messages are `UNKNOWN` (medium / system).
pub fn classify_message(message: &str) -> ErrorReport {
    let lowered = message.to_lowercase();
    for rule in RULES.iter() {
        if lowered.contains(rule.needle) {
            return report(
                rule.code,
                message,
                rule.severity,
                rule.category,
                rule.suggestions.iter().map(|s| s.to_string()).collect(),
            );
        }
    }
    report("UNKNOWN", message, Severity::Medium, Category::System, vec![])
}

fn report(
    code: &str,
    message: &str,
    severity: Severity,
    category: Category,
    suggestions: Vec<String>,
) -> ErrorReport {
    ErrorReport {
        code: code.to_string(),
        message: message.to_string(),
        severity,
        category,
        suggestions,
        technical_details: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_match_is_case_insensitive() {
        let r = classify_message("tcp CONNECTION Refused by peer");
        assert_eq!(r.code, "CONNECTION_REFUSED");
        assert_eq!(r.severity, Severity::High);
        assert_eq!(r.category, Category::Connection);
        assert!(!r.suggestions.is_empty());
    }

    #[test]
    fn unmatched_message_is_unknown() {
        let r = classify_message("something inexplicable happened");
        assert_eq!(r.code, "UNKNOWN");
        assert_eq!(r.severity, Severity::Medium);
        assert_eq!(r.category, Category::System);
    }

    #[test]
    fn typed_variants_take_precedence() {
        let err = DataForgeError::CyclicPipeline {
            pipeline: "pl_1".into(),
        };
        assert_eq!(classify(&err).code, "CYCLIC_PIPELINE");

        let err = DataForgeError::Cancelled;
        assert_eq!(classify(&err).code, "CANCELLED_BY_USER");
    }

    #[test]
    fn retryable_codes() {
        assert!(is_retryable("NETWORK_TIMEOUT"));
        assert!(is_retryable("API_RATE_LIMIT"));
        assert!(is_retryable("CONNECTION_REFUSED"));
        assert!(!is_retryable("INVALID_FILE_FORMAT"));
        assert!(!is_retryable("ACCESS_DENIED"));
        assert!(!is_retryable("DATA_CORRUPTION"));
    }

    #[test]
    fn rate_limit_maps_to_network() {
        let r = classify_message("HTTP 429: rate limit exceeded");
        assert_eq!(r.code, "API_RATE_LIMIT");
        assert_eq!(r.category, Category::Network);
    }
}
