//! Verification results

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Why a value was reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ViolationReason {
    /// The rule ran and returned false; carries the rule's error text
    Failed(String),
    /// The rule could not run
    Errored(String),
    /// No rule answers to the referenced name
    Unresolved,
}

/// One rule a value broke
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Entry path inside the verified value
    pub path: Vec<String>,
    /// Where the rule was found; empty when unresolved
    pub rule_path: Vec<String>,
    /// The reference as written in the schema
    pub rule: String,
    pub value: Value,
    pub reason: ViolationReason,
}

/// Violations found at one entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryViolations {
    pub path: Vec<String>,
    pub violations: Vec<Violation>,
}

/// Aggregated outcome of verifying a compiled value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    /// Violations of rules registered at the schema root
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub root: Vec<Violation>,

    /// Violations at leaf entries, in traversal order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<EntryViolations>,
}

impl ComplianceReport {
    pub fn is_empty(&self) -> bool {
        self.root.is_empty() && self.entries.is_empty()
    }

    /// Total number of violations
    pub fn len(&self) -> usize {
        self.root.len() + self.entries.iter().map(|e| e.violations.len()).sum::<usize>()
    }

    /// Every violation, root first
    pub fn violations(&self) -> impl Iterator<Item = &Violation> {
        self.root
            .iter()
            .chain(self.entries.iter().flat_map(|e| e.violations.iter()))
    }

    /// Violations recorded at `path`
    pub fn at(&self, path: &[&str]) -> Option<&[Violation]> {
        self.entries
            .iter()
            .find(|e| e.path.iter().map(String::as_str).eq(path.iter().copied()))
            .map(|e| e.violations.as_slice())
    }
}

impl fmt::Display for ComplianceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} violation(s)", self.len())?;
        let mut first = true;
        for violation in self.violations() {
            f.write_str(if first { ": " } else { "; " })?;
            first = false;
            write!(f, "{} at [{}]", violation.rule, violation.path.join("."))?;
        }
        Ok(())
    }
}
