//! Profile hub
//!
//! Entry point for profile definitions arriving from outside: a definition
//! for an unknown name is added, one for a known name replaces it.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::bus::ActionBus;
use crate::compiler::Compiler;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::node::{Profile, ProfileNode, ProfilePatch, ProfileState};
use crate::registry::ProfileRegistry;

#[derive(Debug)]
pub struct ProfileHub {
    registry: ProfileRegistry,
}

impl ProfileHub {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            registry: ProfileRegistry::new(config),
        }
    }

    /// Hub compiling into a cache shared with other registries
    pub fn with_parts(config: EngineConfig, compiler: Arc<Compiler>, bus: Arc<ActionBus>) -> Self {
        Self {
            registry: ProfileRegistry::with_parts(config, compiler, bus),
        }
    }

    /// Add a profile, or replace the definition of an existing one
    pub fn handle_profile(&mut self, profile: Profile) -> Result<()> {
        if self.registry.contains(&profile.name) {
            debug!("Replacing profile {}", profile.name);
            let name = profile.name.clone();
            self.registry.update(&name, ProfilePatch::from(profile))
        } else {
            self.registry.add(ProfileNode::new(profile))
        }
    }

    pub fn delete_profile(&mut self, name: &str) -> Result<Profile> {
        self.registry
            .delete(name)
            .map(|node| node.profile().clone())
    }

    pub fn compiled(&self, name: &str) -> Option<Arc<Value>> {
        self.registry.compiled(name)
    }

    pub fn state(&self, name: &str) -> Option<ProfileState> {
        self.registry.state(name)
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ProfileRegistry {
        &mut self.registry
    }

    pub fn bus(&self) -> &Arc<ActionBus> {
        self.registry.bus()
    }
}

impl Default for ProfileHub {
    fn default() -> Self {
        Self::new()
    }
}
