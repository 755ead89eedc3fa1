//! Operation status values returned to callers instead of errors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a status or compatibility verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Ok,
    Warning,
    Error,
    Cancel,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "ok",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Cancel => "cancel",
        }
    }
}

/// Aggregate result of a device operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub severity: Severity,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            severity: Severity::Ok,
            message: String::new(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn cancel() -> Self {
        Self {
            severity: Severity::Cancel,
            message: "Operation was cancelled".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.severity == Severity::Ok
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn is_cancel(&self) -> bool {
        self.severity == Severity::Cancel
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.severity.as_str())
        } else {
            write!(f, "{}: {}", self.severity.as_str(), self.message)
        }
    }
}
