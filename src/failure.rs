//! Classification of recorded startup errors.
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Broad cause of a failed startup, derived from its error text.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureCategory {
    PortConflict,
    ConnectionRefused,
    Timeout,
    BuildError,
    DependencyError,
    Unknown,
}

static PATTERNS: LazyLock<Vec<(FailureCategory, Regex)>> = LazyLock::new(|| {
    [
        (
            FailureCategory::PortConflict,
            r"(?i)address already in use|eaddrinuse|port \d+ (is )?(already )?in use|os error (48|98)",
        ),
        (
            FailureCategory::ConnectionRefused,
            r"(?i)connection refused|econnrefused|os error (61|111)",
        ),
        (
            FailureCategory::Timeout,
            r"(?i)timed? ?out|timeout|deadline exceeded",
        ),
        (
            FailureCategory::BuildError,
            r"(?i)build (step )?failed|failed to compile|compilation (failed|error)|error\[e\d+\]|syntaxerror",
        ),
        (
            FailureCategory::DependencyError,
            r"(?i)modulenotfounderror|no module named|cannot find module|importerror|missing dependency|dependency .* (failed|missing)",
        ),
    ]
    .into_iter()
    .map(|(category, pattern)| (category, Regex::new(pattern).expect("static regex is valid")))
    .collect()
});

/// Maps an error string onto the first matching category.
pub fn classify(text: &str) -> FailureCategory {
    PATTERNS
        .iter()
        .find(|(_, regex)| regex.is_match(text))
        .map(|(category, _)| *category)
        .unwrap_or(FailureCategory::Unknown)
}
