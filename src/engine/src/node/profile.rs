//! Profile nodes
//!
//! Profiles are the lighter sibling of entitlements: two states, no flags,
//! and no compliance verification. A profile is valid exactly when it holds
//! a compiled value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::{Effect, Node, Origin, PatchOutcome, Request, Signal};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileState {
    #[default]
    Invalid,
    Valid,
}

/// Free-form descriptive data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Profile definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,

    #[serde(default = "empty_object")]
    pub entitlements: Value,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub metadata: ProfileMetadata,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Profile {
    pub fn new(name: impl Into<String>, entitlements: Value) -> Self {
        Self {
            name: name.into(),
            entitlements,
            dependencies: Vec::new(),
            metadata: ProfileMetadata::default(),
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
}

/// Partial update of a profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(default)]
    pub entitlements: Option<Value>,

    #[serde(default)]
    pub dependencies: Option<Vec<String>>,

    #[serde(default)]
    pub metadata: Option<ProfileMetadata>,
}

impl From<Profile> for ProfilePatch {
    /// A full definition replaces every field
    fn from(profile: Profile) -> Self {
        Self {
            entitlements: Some(profile.entitlements),
            dependencies: Some(profile.dependencies),
            metadata: Some(profile.metadata),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProfileNode {
    profile: Profile,
    state: ProfileState,
    dependency_states: HashMap<String, bool>,
    compiled: Option<Arc<Value>>,
}

impl ProfileNode {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            state: ProfileState::Invalid,
            dependency_states: HashMap::new(),
            compiled: None,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn state(&self) -> ProfileState {
        self.state
    }

    /// Drop to Invalid; true if the node was Valid before
    fn invalidate(&mut self) -> bool {
        let was_valid = self.state == ProfileState::Valid;
        self.state = ProfileState::Invalid;
        self.compiled = None;
        was_valid
    }

    fn compile_if_ready(&self) -> Vec<Effect> {
        if self.is_compilable() {
            vec![Effect::Request(Request::Compile)]
        } else {
            Vec::new()
        }
    }
}

impl Node for ProfileNode {
    const KIND: &'static str = "Profile";

    type Patch = ProfilePatch;

    fn key(&self) -> &str {
        &self.profile.name
    }

    fn dependencies(&self) -> &[String] {
        &self.profile.dependencies
    }

    fn layers(&self) -> Vec<Value> {
        vec![self.profile.entitlements.clone()]
    }

    fn compiled(&self) -> Option<&Arc<Value>> {
        self.compiled.as_ref()
    }

    fn is_dependable(&self) -> bool {
        self.state == ProfileState::Valid
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

    fn patched_dependencies(patch: &ProfilePatch) -> Option<&[String]> {
        patch.dependencies.as_deref()
    }

    fn apply_patch(&mut self, patch: ProfilePatch) -> PatchOutcome {
        let mut outcome = PatchOutcome::default();

        if let Some(entitlements) = patch.entitlements {
            if entitlements != self.profile.entitlements {
                self.profile.entitlements = entitlements;
                outcome.content_changed = true;
            }
        }
        if let Some(dependencies) = patch.dependencies {
            if dependencies != self.profile.dependencies {
                self.profile.dependencies = dependencies;
                outcome.dependencies_changed = true;
            }
        }
        if let Some(metadata) = patch.metadata {
            self.profile.metadata = metadata;
        }

        outcome
    }

    fn on_state_changed(&mut self, signal: &Signal, origin: &Origin) -> Vec<Effect> {
        if origin.is_node(&self.profile.name) {
            return Vec::new();
        }

        match signal {
            Signal::Added => self.compile_if_ready(),
            Signal::Compiled(value) => {
                self.compiled = Some(Arc::clone(value));
                self.state = ProfileState::Valid;
                vec![Effect::broadcast(Signal::Validated)]
            }
            Signal::Updated => {
                let mut effects = Vec::new();
                if self.invalidate() {
                    effects.push(Effect::broadcast(Signal::Invalidated));
                }
                effects.extend(self.compile_if_ready());
                effects
            }
            Signal::Deleted => {
                if self.invalidate() {
                    vec![Effect::broadcast(Signal::Invalidated)]
                } else {
                    Vec::new()
                }
            }
            Signal::Validated | Signal::Invalidated | Signal::Customized(_) => Vec::new(),
        }
    }

    fn on_dependency_changed(&mut self, dependency: &str, signal: &Signal) -> Vec<Effect> {
        let recorded_valid = self.dependency_states.get(dependency).copied() == Some(true);

        match signal {
            Signal::Invalidated | Signal::Deleted | Signal::Updated if recorded_valid => {
                self.dependency_states.insert(dependency.to_string(), false);
                if self.invalidate() {
                    vec![Effect::broadcast_global(Signal::Invalidated)]
                } else {
                    Vec::new()
                }
            }
            Signal::Validated if !recorded_valid => {
                self.dependency_states.insert(dependency.to_string(), true);
                self.compile_if_ready()
            }
            _ => Vec::new(),
        }
    }
}
