//! # Permit Engine
//!
//! Incremental compiler for layered entitlements and profiles, with a
//! compliance rule engine checking the compiled values.
//!
//! ## Features
//!
//! - **Dependency graph** of nodes, each compiled by deep-merging its
//!   dependencies' compiled values with its own data
//! - **Incremental invalidation**: changes cascade to dependents only
//! - **Flag-based lifecycle** for entitlements (active, compiled, valid,
//!   implicit, sealed, pinned)
//! - **Scoped compliance rules** defined per schema entry, with user rules
//!   written in CEL and run in a time-bounded sandbox
//! - **Out-of-process compilation** over a JSON message channel
//!
//! ## Example
//!
//! ```rust
//! use permit_engine::{Entitlement, EntitlementNode, EntitlementRegistry, EngineConfig};
//! use serde_json::json;
//!
//! let mut registry = EntitlementRegistry::new(EngineConfig::default());
//! registry.add(EntitlementNode::new(Entitlement::new("base", json!({"seats": 5}))))?;
//! registry.add(EntitlementNode::new(
//!     Entitlement::new("team", json!({"admin": true})).with_dependencies(["base"]),
//! ))?;
//!
//! let team = registry.compiled("team").unwrap();
//! assert_eq!(*team, json!({"seats": 5, "admin": true}));
//! # Ok::<(), permit_engine::EngineError>(())
//! ```

pub mod bus;
pub mod compiler;
pub mod compliance;
pub mod config;
pub mod error;
pub mod hub;
pub mod node;
pub mod registry;

// Re-export commonly used types
pub use bus::{Action, ActionBus, Channel};
pub use compiler::remote::{drive, spawn_local_service, CompilerClient, CompilerService};
pub use compiler::{CompileJob, Compiler};
pub use compliance::{ComplianceEngine, ComplianceReport, SchemaNode, Verifier};
pub use config::{CompileMode, EngineConfig, SandboxConfig};
pub use error::{EngineError, Result};
pub use hub::ProfileHub;
pub use node::{
    Entitlement, EntitlementNode, EntitlementPatch, Flags, Profile, ProfileNode, ProfilePatch,
    ProfileState,
};
pub use registry::{EntitlementRegistry, ProfileRegistry, Registry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
