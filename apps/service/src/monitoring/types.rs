use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status reported by a check, using the Nagios plug-in exit code convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Ok = 0,
    Warning = 1,
    Critical = 2,
    Unknown = 3,
    NotRun = 4,
    Maintenance = 5,
}

impl CheckStatus {
    /// Map a plug-in exit code onto a status. Anything outside `0..=5` is not a status.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(CheckStatus::Ok),
            1 => Some(CheckStatus::Warning),
            2 => Some(CheckStatus::Critical),
            3 => Some(CheckStatus::Unknown),
            4 => Some(CheckStatus::NotRun),
            5 => Some(CheckStatus::Maintenance),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Label shown on the dashboard legend
    pub fn short_name(self) -> &'static str {
        match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warning => "WARNING",
            CheckStatus::Critical => "CRITICAL",
            CheckStatus::Unknown => "UNKNOWN",
            CheckStatus::NotRun => "NOT RUN",
            CheckStatus::Maintenance => "MAINTENANCE",
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Result of a single check invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Status of the check
    pub status: CheckStatus,

    /// Human readable output of the plug-in
    pub message: String,

    /// Performance data reported after the `|` of the plug-in output
    pub stats: Option<HashMap<String, String>>,
}

impl CheckResult {
    pub fn new(status: CheckStatus, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), stats: None }
    }

    /// Result used for every failure that is not the plug-in's own verdict
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(CheckStatus::Unknown, message)
    }

    pub fn with_stats(mut self, stats: Option<HashMap<String, String>>) -> Self {
        self.stats = stats;
        self
    }

    /// Add a stat, creating the stats map if the plug-in reported none
    pub fn insert_stat(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.stats.get_or_insert_with(HashMap::new).insert(key.into(), value.into());
    }

    #[cfg(test)]
    pub fn stat(&self, key: &str) -> Option<&str> {
        self.stats.as_ref().and_then(|stats| stats.get(key)).map(String::as_str)
    }
}
