//! Error types for the entitlement engine

use std::fmt;

use thiserror::Error;

use crate::compliance::report::ComplianceReport;

/// Why a registry refused to touch a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForbiddenReason {
    /// The node is pinned and can not be deleted
    Pinned,
    /// The node is sealed and can not be updated
    Sealed,
}

impl fmt::Display for ForbiddenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pinned => write!(f, "pinned and can not be deleted"),
            Self::Sealed => write!(f, "sealed and can not be updated"),
        }
    }
}

/// Entitlement engine errors
///
/// Every variant is recoverable: the engine stays usable after any of them.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A node with the same key is already registered
    #[error("Node [\"{0}\"] is already added")]
    AlreadyExists(String),

    /// No node with this key is registered
    #[error("Node [\"{0}\"] is not registered")]
    NotFound(String),

    /// The node's flags forbid the operation
    #[error("Node [\"{key}\"] is {reason}")]
    Forbidden { key: String, reason: ForbiddenReason },

    /// Some dependencies have no compiled value yet; retry once they do
    #[error("Node [\"{key}\"] is missing compiled dependencies: {missing:?}")]
    MissingDependency { key: String, missing: Vec<String> },

    /// The dependency list would close a cycle
    #[error("Circular dependency detected: {0}")]
    CyclicDependency(String),

    /// Malformed node, schema or rule definition
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    /// A user-defined rule failed to compile while loading a schema
    #[error("Failed to compile \"{rule}\" rule at {path:?} of schema \"{schema}\": {cause}")]
    RuleCompileFailure {
        schema: String,
        path: Vec<String>,
        rule: String,
        source_text: String,
        cause: String,
    },

    /// A compiled value broke one or more compliance rules
    #[error("Compliance verification failed: {0}")]
    RuleVerificationFailure(Box<ComplianceReport>),

    /// Sandbox infrastructure failure
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short machine-friendly name used when the error is published on the bus
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyExists(_) => "already_exists",
            Self::NotFound(_) => "not_found",
            Self::Forbidden { .. } => "forbidden",
            Self::MissingDependency { .. } => "missing_dependency",
            Self::CyclicDependency(_) => "cyclic_dependency",
            Self::InvalidDefinition(_) => "invalid_definition",
            Self::RuleCompileFailure { .. } => "rule_compile_failure",
            Self::RuleVerificationFailure(_) => "rule_verification_failure",
            Self::Sandbox(_) => "sandbox",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
