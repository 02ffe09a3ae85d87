//! Read-only verification of runs against their artifacts, the store and
//! reference results.

pub mod results;
pub mod structure;

pub use results::*;
pub use structure::*;

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// One verified expectation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Check {
    pub description: String,
    pub passed: bool,
    pub detail: Option<String>,
}

/// Result of a comparison command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub name: &'static str,
    pub checks: Vec<Check>,
}

impl ComparisonReport {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            checks: Vec::new(),
        }
    }

    pub fn check(&mut self, description: impl Into<String>, passed: bool) -> &mut Self {
        self.checks.push(Check {
            description: description.into(),
            passed,
            detail: None,
        });
        self
    }

    /// Record a check that failed (or passed) with an explanation.
    pub fn check_with(
        &mut self,
        description: impl Into<String>,
        passed: bool,
        detail: impl Into<String>,
    ) -> &mut Self {
        self.checks.push(Check {
            description: description.into(),
            passed,
            detail: Some(detail.into()),
        });
        self
    }

    pub fn passed(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// Stable digest of all checks; equal for equal store contents.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        for check in &self.checks {
            hasher.update(check.description.as_bytes());
            hasher.update([check.passed as u8]);
            if let Some(detail) = &check.detail {
                hasher.update(detail.as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for check in &self.checks {
            let mark = if check.passed { "ok" } else { "FAILED" };
            match &check.detail {
                Some(detail) => writeln!(f, "[{mark}] {} ({detail})", check.description)?,
                None => writeln!(f, "[{mark}] {}", check.description)?,
            }
        }
        let verdict = if self.passed() { "passed" } else { "failed" };
        writeln!(f, "{} {verdict}, fingerprint {}", self.name, self.fingerprint())
    }
}
