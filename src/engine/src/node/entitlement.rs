//! Entitlement nodes

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::Arc;
use uuid::Uuid;

use super::{Effect, Node, Origin, PatchOutcome, Request, Signal};
use crate::error::{EngineError, ForbiddenReason, Result};

/// Entitlement state flags
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(u8);

impl Flags {
    pub const ACTIVE: Flags = Flags(1);
    pub const COMPILED: Flags = Flags(1 << 1);
    pub const VALID: Flags = Flags(1 << 2);
    /// Suppresses directory announcement
    pub const IMPLICIT: Flags = Flags(1 << 3);
    /// Forbids update
    pub const SEALED: Flags = Flags(1 << 4);
    /// Forbids delete
    pub const PINNED: Flags = Flags(1 << 5);

    /// Safe for dependents to compile against
    pub const DEPENDABLE: Flags = Flags(Self::ACTIVE.0 | Self::VALID.0);

    /// Flags only the engine itself may set
    pub const DERIVED: Flags = Flags(Self::COMPILED.0 | Self::VALID.0);

    /// Flags a customize request may set
    pub const CUSTOMIZABLE: Flags =
        Flags(Self::ACTIVE.0 | Self::IMPLICIT.0 | Self::SEALED.0 | Self::PINNED.0);

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        Flags(bits & 0b0011_1111)
    }

    /// All bits of `other` are set
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = Flags;

    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl Not for Flags {
    type Output = Flags;

    fn not(self) -> Flags {
        Flags::from_bits_truncate(!self.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 6] = [
            (Flags::ACTIVE, "ACTIVE"),
            (Flags::COMPILED, "COMPILED"),
            (Flags::VALID, "VALID"),
            (Flags::IMPLICIT, "IMPLICIT"),
            (Flags::SEALED, "SEALED"),
            (Flags::PINNED, "PINNED"),
        ];

        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();

        if names.is_empty() {
            write!(f, "Flags(empty)")
        } else {
            write!(f, "Flags({})", names.join(" | "))
        }
    }
}

/// Descriptive data carried along with an entitlement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitlementMetadata {
    /// Service the entitlement id was generated for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<Uuid>,

    /// Compliance resource the compiled value must satisfy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Entitlement definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: String,

    /// Own payload, merged over the dependencies
    #[serde(default = "empty_object")]
    pub own: Value,

    /// Completion payload, merged last
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<Value>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub metadata: EntitlementMetadata,

    /// Initial user flags (IMPLICIT, SEALED, PINNED)
    #[serde(default)]
    pub flags: Flags,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Entitlement {
    pub fn new(id: impl Into<String>, own: Value) -> Self {
        Self {
            id: id.into(),
            own,
            completion: None,
            dependencies: Vec::new(),
            metadata: EntitlementMetadata::default(),
            flags: Flags::empty(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_completion(mut self, completion: Value) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.metadata.resource = Some(resource.into());
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }
}

/// Partial update of an entitlement; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitlementPatch {
    #[serde(default)]
    pub own: Option<Value>,

    #[serde(default)]
    pub completion: Option<Value>,

    #[serde(default)]
    pub dependencies: Option<Vec<String>>,

    #[serde(default)]
    pub metadata: Option<EntitlementMetadata>,
}

impl EntitlementPatch {
    pub fn own(own: Value) -> Self {
        Self {
            own: Some(own),
            ..Self::default()
        }
    }

    pub fn dependencies<I, S>(dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dependencies: Some(dependencies.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn metadata(metadata: EntitlementMetadata) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::default()
        }
    }
}

/// Registry node wrapping an [`Entitlement`]
#[derive(Debug, Clone)]
pub struct EntitlementNode {
    entitlement: Entitlement,
    state: Flags,
    dependency_states: HashMap<String, bool>,
    compiled: Option<Arc<Value>>,
}

impl EntitlementNode {
    pub fn new(entitlement: Entitlement) -> Self {
        let state = entitlement.flags & (Flags::IMPLICIT | Flags::SEALED | Flags::PINNED);
        Self {
            entitlement,
            state,
            dependency_states: HashMap::new(),
            compiled: None,
        }
    }

    pub fn entitlement(&self) -> &Entitlement {
        &self.entitlement
    }

    pub fn state(&self) -> Flags {
        self.state
    }

    pub fn is(&self, flags: Flags) -> bool {
        self.state.contains(flags)
    }

    fn invalidate(&mut self) {
        self.state.remove(Flags::DERIVED);
        self.compiled = None;
    }

    fn compile_if_ready(&self) -> Vec<Effect> {
        if self.is_compilable() {
            vec![Effect::Request(Request::Compile)]
        } else {
            Vec::new()
        }
    }

    fn announce(&self) -> Vec<Effect> {
        let mut effects = vec![Effect::broadcast(Signal::Validated)];
        if !self.is(Flags::IMPLICIT) {
            effects.push(Effect::Request(Request::Announce));
        }
        effects
    }

    fn customize(&mut self, mask: Flags) -> Vec<Effect> {
        let was_active = self.is(Flags::ACTIVE);
        self.state = (mask & Flags::CUSTOMIZABLE) | (self.state & Flags::DERIVED);
        let active = self.is(Flags::ACTIVE);

        match (was_active, active) {
            (true, false) => vec![Effect::broadcast(Signal::Invalidated)],
            (false, true) if self.is(Flags::VALID) => self.announce(),
            (false, true) if !self.is(Flags::COMPILED) => self.compile_if_ready(),
            _ => Vec::new(),
        }
    }
}

impl Node for EntitlementNode {
    const KIND: &'static str = "Entitlement";

    type Patch = EntitlementPatch;

    fn key(&self) -> &str {
        &self.entitlement.id
    }

    fn dependencies(&self) -> &[String] {
        &self.entitlement.dependencies
    }

    fn layers(&self) -> Vec<Value> {
        let mut layers = vec![self.entitlement.own.clone()];
        if let Some(completion) = &self.entitlement.completion {
            layers.push(completion.clone());
        }
        layers
    }

    fn resource(&self) -> Option<&str> {
        self.entitlement.metadata.resource.as_deref()
    }

    fn compiled(&self) -> Option<&Arc<Value>> {
        self.compiled.as_ref()
    }

    fn is_dependable(&self) -> bool {
        self.is(Flags::DEPENDABLE)
    }

    fn dependency_states(&self) -> &HashMap<String, bool> {
        &self.dependency_states
    }

    fn set_dependency_states(&mut self, states: HashMap<String, bool>) {
        self.dependency_states = states;
    }

    fn reset(&mut self) {
        self.invalidate();
        for ready in self.dependency_states.values_mut() {
            *ready = false;
        }
    }

    fn check_delete(&self) -> Result<()> {
        if self.is(Flags::PINNED) {
            return Err(EngineError::Forbidden {
                key: self.entitlement.id.clone(),
                reason: ForbiddenReason::Pinned,
            });
        }
        Ok(())
    }

    fn check_update(&self) -> Result<()> {
        if self.is(Flags::SEALED) {
            return Err(EngineError::Forbidden {
                key: self.entitlement.id.clone(),
                reason: ForbiddenReason::Sealed,
            });
        }
        Ok(())
    }

    fn patched_dependencies(patch: &EntitlementPatch) -> Option<&[String]> {
        patch.dependencies.as_deref()
    }

    fn apply_patch(&mut self, patch: EntitlementPatch) -> PatchOutcome {
        let mut outcome = PatchOutcome::default();

        if let Some(own) = patch.own {
            if own != self.entitlement.own {
                self.entitlement.own = own;
                outcome.content_changed = true;
            }
        }
        if let Some(completion) = patch.completion {
            if Some(&completion) != self.entitlement.completion.as_ref() {
                self.entitlement.completion = Some(completion);
                outcome.content_changed = true;
            }
        }
        if let Some(dependencies) = patch.dependencies {
            if dependencies != self.entitlement.dependencies {
                self.entitlement.dependencies = dependencies;
                outcome.dependencies_changed = true;
            }
        }
        if let Some(metadata) = patch.metadata {
            outcome.resource_changed = metadata.resource != self.entitlement.metadata.resource;
            self.entitlement.metadata = metadata;
        }

        outcome
    }

    fn on_state_changed(&mut self, signal: &Signal, origin: &Origin) -> Vec<Effect> {
        if origin.is_node(&self.entitlement.id) {
            return Vec::new();
        }

        match signal {
            Signal::Added => {
                self.state.insert(Flags::ACTIVE);
                self.compile_if_ready()
            }
            Signal::Compiled(value) => {
                self.compiled = Some(Arc::clone(value));
                self.state.insert(Flags::COMPILED);
                vec![Effect::Request(Request::Validate)]
            }
            Signal::Validated => {
                self.state.insert(Flags::VALID);
                if self.is(Flags::ACTIVE) {
                    self.announce()
                } else {
                    Vec::new()
                }
            }
            Signal::Updated => {
                self.invalidate();
                let mut effects = vec![Effect::broadcast(Signal::Invalidated)];
                effects.extend(self.compile_if_ready());
                effects
            }
            Signal::Deleted => {
                self.invalidate();
                vec![Effect::broadcast(Signal::Invalidated)]
            }
            Signal::Customized(mask) => self.customize(*mask),
            Signal::Invalidated => Vec::new(),
        }
    }

    fn on_dependency_changed(&mut self, dependency: &str, signal: &Signal) -> Vec<Effect> {
        match signal {
            Signal::Invalidated | Signal::Deleted | Signal::Updated => {
                let was_dependable = self.is_dependable();
                self.dependency_states.insert(dependency.to_string(), false);

                if self.is_compiled() || self.is(Flags::VALID) {
                    self.invalidate();
                }
                if was_dependable {
                    vec![Effect::broadcast_global(Signal::Invalidated)]
                } else {
                    Vec::new()
                }
            }
            Signal::Validated => {
                self.dependency_states.insert(dependency.to_string(), true);
                self.compile_if_ready()
            }
            _ => Vec::new(),
        }
    }
}
