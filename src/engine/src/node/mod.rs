//! Graph nodes and the signals they exchange
//!
//! A node never touches the registry directly. The registry hands it a
//! [`Signal`], either about itself or about one of its dependencies, and the
//! node answers with a list of [`Effect`]s for the registry to carry out.

pub mod entitlement;
pub mod profile;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

pub use entitlement::{Entitlement, EntitlementMetadata, EntitlementNode, EntitlementPatch, Flags};
pub use profile::{Profile, ProfileMetadata, ProfileNode, ProfilePatch, ProfileState};

/// Lifecycle signal delivered to a node or its dependents
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Added,
    Compiled(Arc<Value>),
    Validated,
    Updated,
    Deleted,
    Customized(Flags),
    Invalidated,
}

impl Signal {
    /// Label used in bus action kinds
    pub fn label(&self) -> &'static str {
        match self {
            Self::Added => "Add Ok",
            Self::Compiled(_) => "Compile Ok",
            Self::Validated => "Validate Ok",
            Self::Updated => "Update Ok",
            Self::Deleted => "Delete Ok",
            Self::Customized(_) => "Customize Ok",
            Self::Invalidated => "Invalid",
        }
    }
}

/// Who raised a signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Registry,
    Node(String),
}

impl Origin {
    pub fn is_node(&self, key: &str) -> bool {
        matches!(self, Self::Node(origin) if origin == key)
    }
}

/// Work a node asks the registry to do on its behalf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Compile,
    Validate,
    Announce,
}

/// Outcome of handling a signal
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Request(Request),
    /// Raise a signal on the node's own channel; `global` also publishes a
    /// kind-scoped action on the bus
    Broadcast { signal: Signal, global: bool },
}

impl Effect {
    pub fn broadcast(signal: Signal) -> Self {
        Self::Broadcast {
            signal,
            global: false,
        }
    }

    pub fn broadcast_global(signal: Signal) -> Self {
        Self::Broadcast {
            signal,
            global: true,
        }
    }
}

/// Which parts of a node an update touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Dependency list was replaced
    pub dependencies_changed: bool,
    /// Payload the compiled value depends on was replaced
    pub content_changed: bool,
    /// Compliance resource moved, so the value must be verified again
    pub resource_changed: bool,
}

impl PatchOutcome {
    pub fn needs_recompile(&self) -> bool {
        self.dependencies_changed || self.content_changed || self.resource_changed
    }
}

/// A node of a dependency graph managed by a [`crate::registry::Registry`]
pub trait Node {
    /// Name used in bus action kinds, e.g. `Entitlement`
    const KIND: &'static str;

    type Patch;

    fn key(&self) -> &str;

    /// Dependency ids, in declared order
    fn dependencies(&self) -> &[String];

    /// Own payload layers, merged after the dependencies
    fn layers(&self) -> Vec<Value>;

    /// Compliance resource the compiled value is verified against
    fn resource(&self) -> Option<&str> {
        None
    }

    fn compiled(&self) -> Option<&Arc<Value>>;

    fn is_compiled(&self) -> bool {
        self.compiled().is_some()
    }

    /// Whether dependents may compile against this node
    fn is_dependable(&self) -> bool;

    /// Dependency readiness as last observed, keyed by dependency id
    fn dependency_states(&self) -> &HashMap<String, bool>;

    /// Replace the dependency readiness snapshot
    fn set_dependency_states(&mut self, states: HashMap<String, bool>);

    /// Every dependency is known to be dependable
    fn is_compilable(&self) -> bool {
        self.dependencies()
            .iter()
            .all(|dep| self.dependency_states().get(dep).copied().unwrap_or(false))
    }

    /// Drop compiled state without raising any signal
    fn reset(&mut self);

    fn check_delete(&self) -> Result<()> {
        Ok(())
    }

    fn check_update(&self) -> Result<()> {
        Ok(())
    }

    /// Dependency list a patch would install, if it replaces it
    fn patched_dependencies(patch: &Self::Patch) -> Option<&[String]>;

    fn apply_patch(&mut self, patch: Self::Patch) -> PatchOutcome;

    /// React to a signal about this node
    fn on_state_changed(&mut self, signal: &Signal, origin: &Origin) -> Vec<Effect>;

    /// React to a signal raised by one of this node's dependencies
    fn on_dependency_changed(&mut self, dependency: &str, signal: &Signal) -> Vec<Effect>;
}

/// Initial readiness snapshot for a dependency list
pub(crate) fn snapshot<F>(dependencies: &[String], is_ready: F) -> HashMap<String, bool>
where
    F: Fn(&str) -> bool,
{
    dependencies
        .iter()
        .map(|dep| (dep.clone(), is_ready(dep)))
        .collect()
}
