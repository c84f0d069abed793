//! Node registry and signal dispatch
//!
//! The registry owns every node of one kind and the channel subscriptions
//! between them. A node is subscribed to its own channel and to the channel
//! of each of its dependencies. Dispatch is synchronous and depth first: a
//! broadcast is fully handled, including every cascade it triggers, before
//! the next listener runs.
//!
//! Add, update and customize results go to the subject node only. Delete
//! results go to the whole channel, subject first, so dependents learn the
//! dependency is gone. Node broadcasts always go to the whole channel.
//!
//! After a delete the dependents stay subscribed to the deleted id, so adding
//! a node with the same id later links them again.

pub mod graph;

#[cfg(test)]
mod tests;

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{lifecycle_kind, Action, ActionBus, DIRECTORY_PUBLISH};
use crate::compiler::remote::{CompileOutcome, CompilerCommand};
use crate::compiler::{CompileJob, Compiler};
use crate::compliance::Verifier;
use crate::config::{CompileMode, EngineConfig};
use crate::error::{EngineError, Result};
use crate::node::{
    snapshot, Effect, EntitlementNode, Flags, Node, Origin, ProfileNode, ProfileState, Request,
    Signal,
};

pub use graph::{DependencyGraph, GraphError};

pub type EntitlementRegistry = Registry<EntitlementNode>;
pub type ProfileRegistry = Registry<ProfileNode>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Listener {
    /// The node owning the channel
    State(String),
    /// A node depending on the channel's owner
    Dependency(String),
}

/// Registry of one kind of node
pub struct Registry<N: Node> {
    nodes: HashMap<String, N>,
    listeners: HashMap<String, Vec<Listener>>,
    graph: DependencyGraph,
    /// Last compile generation handed out, shared by every key so a
    /// re-added node never reuses a number from its previous life
    generation: u64,
    generations: HashMap<String, u64>,
    outbox: Vec<CompilerCommand>,
    compiler: Arc<Compiler>,
    verifier: Option<Arc<dyn Verifier>>,
    bus: Arc<ActionBus>,
    config: EngineConfig,
}

impl<N: Node> Registry<N> {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_parts(config, Arc::new(Compiler::new()), Arc::new(ActionBus::new()))
    }

    /// Build a registry around a shared compiler and bus
    pub fn with_parts(config: EngineConfig, compiler: Arc<Compiler>, bus: Arc<ActionBus>) -> Self {
        info!("{} registry initialized with compile_mode={:?}", N::KIND, config.compile_mode);
        Self {
            nodes: HashMap::new(),
            listeners: HashMap::new(),
            graph: DependencyGraph::new(),
            generation: 0,
            generations: HashMap::new(),
            outbox: Vec::new(),
            compiler,
            verifier: None,
            bus,
            config,
        }
    }

    /// Verify compiled values before marking nodes valid
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<ActionBus> {
        &self.bus
    }

    pub fn compiler(&self) -> &Arc<Compiler> {
        &self.compiler
    }

    pub fn get(&self, key: &str) -> Option<&N> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Cached compiled value of a node
    pub fn compiled(&self, key: &str) -> Option<Arc<Value>> {
        self.compiler.get(key)
    }

    /// Fresh id for a node owned by `service_id`
    pub fn generate_id(&self, service_id: &Uuid) -> String {
        loop {
            let id = Uuid::new_v5(service_id, Uuid::new_v4().as_bytes()).to_string();
            if !self.nodes.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a node and start its lifecycle
    ///
    /// # Errors
    ///
    /// - [`EngineError::AlreadyExists`] if the key is taken
    /// - [`EngineError::CyclicDependency`] if the dependencies close a cycle
    /// - [`EngineError::InvalidDefinition`] for empty keys or duplicate
    ///   dependencies
    pub fn add(&mut self, mut node: N) -> Result<()> {
        let key = node.key().to_string();

        if self.nodes.contains_key(&key) {
            return self.fail("Add Error", &key, EngineError::AlreadyExists(key.clone()));
        }
        if let Err(err) = self.graph.check(&key, node.dependencies()) {
            return self.fail("Add Error", &key, err.into());
        }

        let dependencies = node.dependencies().to_vec();
        node.set_dependency_states(snapshot(&dependencies, |dep| self.is_dependable(dep)));

        self.graph.insert(key.clone(), dependencies.clone());
        self.nodes.insert(key.clone(), node);
        self.subscribe(&key, Listener::State(key.clone()));
        for dependency in &dependencies {
            self.subscribe(dependency, Listener::Dependency(key.clone()));
        }

        info!("Adding {}: {}", N::KIND, key);
        self.publish_signal(&key, &Signal::Added, true);
        self.deliver(&key, Signal::Added);

        Ok(())
    }

    /// Remove a node, invalidating everything depending on it
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] if no such node exists
    /// - [`EngineError::Forbidden`] if the node refuses deletion
    pub fn delete(&mut self, key: &str) -> Result<N> {
        let check = match self.nodes.get(key) {
            Some(node) => node.check_delete(),
            None => Err(EngineError::NotFound(key.to_string())),
        };
        if let Err(err) = check {
            return self.fail("Delete Error", key, err);
        }

        info!("Removing {}: {}", N::KIND, key);
        self.publish_signal(key, &Signal::Deleted, true);
        self.dispatch(key, &Signal::Deleted, &Origin::Registry);

        let node = self
            .nodes
            .remove(key)
            .ok_or_else(|| EngineError::Internal(format!("node {key} vanished during delete")))?;

        self.unsubscribe(key, &Listener::State(key.to_string()));
        for dependency in node.dependencies() {
            self.unsubscribe(dependency, &Listener::Dependency(key.to_string()));
        }
        self.graph.remove(key);
        self.generations.remove(key);
        self.outbox.retain(|command| !command.is_compile_of(key));
        self.evict(key);

        Ok(node)
    }

    /// Apply a partial update
    ///
    /// Nodes recompile when their payload, dependency list or compliance
    /// resource actually changed; other metadata updates leave the compiled
    /// value alone.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] if no such node exists
    /// - [`EngineError::Forbidden`] if the node refuses updates
    /// - [`EngineError::CyclicDependency`] if new dependencies close a cycle
    pub fn update(&mut self, key: &str, patch: N::Patch) -> Result<()> {
        let check = match self.nodes.get(key) {
            Some(node) => node.check_update(),
            None => Err(EngineError::NotFound(key.to_string())),
        };
        if let Err(err) = check {
            return self.fail("Update Error", key, err);
        }
        if let Some(dependencies) = N::patched_dependencies(&patch) {
            if let Err(err) = self.graph.check(key, dependencies) {
                return self.fail("Update Error", key, err.into());
            }
        }

        let (previous, outcome) = match self.nodes.get_mut(key) {
            Some(node) => {
                let previous = node.dependencies().to_vec();
                (previous, node.apply_patch(patch))
            }
            None => return Err(EngineError::NotFound(key.to_string())),
        };

        if outcome.dependencies_changed {
            self.relink(key, &previous);
        }

        debug!("Updated {} {}: {:?}", N::KIND, key, outcome);
        self.publish_global(key, &Signal::Updated);
        if outcome.needs_recompile() {
            self.bus
                .publish(Action::new(lifecycle_kind(N::KIND, Signal::Updated.label())).with_id(key));
            self.deliver(key, Signal::Updated);
        }

        Ok(())
    }

    /// Replace a node's user flags
    pub fn customize(&mut self, key: &str, flags: Flags) -> Result<()> {
        if !self.nodes.contains_key(key) {
            return self.fail("Customize Error", key, EngineError::NotFound(key.to_string()));
        }

        debug!("Customizing {} {}: {:?}", N::KIND, key, flags);
        self.publish_signal(key, &Signal::Customized(flags), true);
        self.deliver(key, Signal::Customized(flags));
        Ok(())
    }

    /// Drop every compiled value and rebuild from the roots
    pub fn clear_cache(&mut self) {
        info!("Clearing {} cache ({} nodes)", N::KIND, self.nodes.len());

        self.compiler.clear();
        if self.config.compile_mode == CompileMode::Deferred {
            self.outbox.clear();
            self.outbox.push(CompilerCommand::Clear);
        }
        for node in self.nodes.values_mut() {
            node.reset();
        }
        self.bus.publish(Action::new(lifecycle_kind(N::KIND, "Cache Cleared")));

        let mut roots: Vec<String> = self
            .nodes
            .values()
            .filter(|node| node.is_compilable())
            .map(|node| node.key().to_string())
            .collect();
        roots.sort();

        for key in roots {
            self.request_compile(&key);
        }
    }

    /// Commands queued in deferred mode, oldest first
    pub fn take_outbox(&mut self) -> Vec<CompilerCommand> {
        std::mem::take(&mut self.outbox)
    }

    pub fn has_pending(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Feed back the result of a deferred compile
    ///
    /// Results for a superseded generation, or for a node whose
    /// dependencies stopped being dependable meanwhile, are dropped.
    pub fn apply_compile_outcome(&mut self, key: &str, outcome: CompileOutcome) {
        if self.generations.get(key).copied() != Some(outcome.generation()) {
            debug!("Dropping stale compile result for {}", key);
            return;
        }
        self.bump_generation(key);

        match outcome {
            CompileOutcome::Compiled { value, .. } => {
                let ready = self
                    .nodes
                    .get(key)
                    .map(|node| node.dependencies().iter().all(|dep| self.is_dependable(dep)))
                    .unwrap_or(false);
                if !ready {
                    debug!("Dropping compile result for {}, dependencies changed", key);
                    return;
                }
                self.compiler.publish(key, Arc::clone(&value));
                self.complete_compile(key, value);
            }
            CompileOutcome::Failed { missing, .. } => {
                let err = EngineError::MissingDependency {
                    key: key.to_string(),
                    missing,
                };
                warn!("Remote compile of {} failed: {}", key, err);
                self.publish_error("Compile Error", key, &err);
            }
        }
    }

    fn is_dependable(&self, key: &str) -> bool {
        self.nodes.get(key).map(N::is_dependable).unwrap_or(false)
    }

    fn subscribe(&mut self, channel: &str, listener: Listener) {
        let listeners = self.listeners.entry(channel.to_string()).or_default();
        if !listeners.contains(&listener) {
            listeners.push(listener);
        }
    }

    fn unsubscribe(&mut self, channel: &str, listener: &Listener) {
        if let Some(listeners) = self.listeners.get_mut(channel) {
            listeners.retain(|l| l != listener);
            if listeners.is_empty() {
                self.listeners.remove(channel);
            }
        }
    }

    /// Move a node's dependency subscriptions after its list changed
    fn relink(&mut self, key: &str, previous: &[String]) {
        let listener = Listener::Dependency(key.to_string());
        for dependency in previous {
            self.unsubscribe(dependency, &listener);
        }

        let current = match self.nodes.get(key) {
            Some(node) => node.dependencies().to_vec(),
            None => return,
        };
        for dependency in &current {
            self.subscribe(dependency, listener.clone());
        }

        let states = snapshot(&current, |dep| self.is_dependable(dep));
        if let Some(node) = self.nodes.get_mut(key) {
            node.set_dependency_states(states);
        }
        self.graph.insert(key.to_string(), current);
    }

    /// Hand a signal to one node only
    fn deliver(&mut self, key: &str, signal: Signal) {
        self.handle(key, |node| node.on_state_changed(&signal, &Origin::Registry));
    }

    /// Hand a signal to every listener of a channel, in subscription order
    fn dispatch(&mut self, channel: &str, signal: &Signal, origin: &Origin) {
        let listeners = match self.listeners.get(channel) {
            Some(listeners) => listeners.clone(),
            None => return,
        };

        for listener in listeners {
            match listener {
                Listener::State(key) => {
                    self.handle(&key, |node| node.on_state_changed(signal, origin))
                }
                Listener::Dependency(key) => {
                    self.handle(&key, |node| node.on_dependency_changed(channel, signal))
                }
            }
        }
    }

    fn handle<F>(&mut self, key: &str, react: F)
    where
        F: FnOnce(&mut N) -> Vec<Effect>,
    {
        let Some(node) = self.nodes.get_mut(key) else {
            return;
        };

        let was_compiled = node.is_compiled();
        let effects = react(node);
        let lost_compiled = was_compiled && !node.is_compiled();

        if lost_compiled {
            self.evict(key);
        }
        self.apply_effects(key, effects);
    }

    fn apply_effects(&mut self, key: &str, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Broadcast { signal, global } => {
                    self.publish_signal(key, &signal, global);
                    self.dispatch(key, &signal, &Origin::Node(key.to_string()));
                }
                Effect::Request(Request::Compile) => self.request_compile(key),
                Effect::Request(Request::Validate) => self.validate(key),
                Effect::Request(Request::Announce) => self.announce(key),
            }
        }
    }

    fn request_compile(&mut self, key: &str) {
        let (dependencies, layers) = match self.nodes.get(key) {
            Some(node) => (node.dependencies().to_vec(), node.layers()),
            None => return,
        };

        let missing: Vec<String> = dependencies
            .iter()
            .filter(|dep| !self.is_dependable(dep))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let err = EngineError::MissingDependency {
                key: key.to_string(),
                missing,
            };
            debug!("Not compiling {}: {}", key, err);
            self.publish_error("Compile Error", key, &err);
            return;
        }

        let generation = self.bump_generation(key);
        let job = CompileJob {
            id: key.to_string(),
            generation,
            dependencies,
            layers,
        };

        match self.config.compile_mode {
            CompileMode::Inline => match self.compiler.compile(&job) {
                Ok(value) => self.complete_compile(key, value),
                Err(err) => {
                    warn!("Compile of {} failed: {}", key, err);
                    self.publish_error("Compile Error", key, &err);
                }
            },
            CompileMode::Deferred => self.queue(CompilerCommand::Compile(job)),
        }
    }

    fn complete_compile(&mut self, key: &str, value: Arc<Value>) {
        let signal = Signal::Compiled(value);
        self.publish_signal(key, &signal, false);
        self.deliver(key, signal);
    }

    fn validate(&mut self, key: &str) {
        let (value, resource) = match self.nodes.get(key) {
            Some(node) => match node.compiled() {
                Some(value) => (Arc::clone(value), node.resource().map(str::to_string)),
                None => return,
            },
            None => return,
        };

        let verdict = match (&self.verifier, resource.as_deref()) {
            (Some(verifier), Some(resource)) => verifier.verify(resource, &value),
            _ => Ok(()),
        };

        match verdict {
            Ok(()) => self.deliver(key, Signal::Validated),
            Err(err) => {
                warn!("{} {} failed validation: {}", N::KIND, key, err);
                self.publish_error("Validate Error", key, &err);
            }
        }
    }

    fn announce(&mut self, key: &str) {
        let Some(value) = self.nodes.get(key).and_then(|node| node.compiled().cloned()) else {
            return;
        };

        debug!("Announcing {} {}", N::KIND, key);
        self.bus.publish(Action::new(DIRECTORY_PUBLISH).with_payload(json!({
            "kind": N::KIND,
            "id": key,
            "value": value.as_ref(),
        })));
    }

    fn bump_generation(&mut self, key: &str) -> u64 {
        self.generation += 1;
        self.generations.insert(key.to_string(), self.generation);
        self.generation
    }

    fn queue(&mut self, command: CompilerCommand) {
        if let CompilerCommand::Compile(job) = &command {
            let id = job.id.clone();
            self.outbox.retain(|queued| !queued.is_compile_of(&id));
        }
        self.outbox.push(command);
    }

    fn evict(&mut self, key: &str) {
        self.compiler.evict(&[key]);
        if self.config.compile_mode == CompileMode::Deferred {
            self.outbox.push(CompilerCommand::Evict(vec![key.to_string()]));
        }
    }

    /// Mirror a signal on the bus: id channel, and the kind channel if global
    fn publish_signal(&self, key: &str, signal: &Signal, global: bool) {
        let kind = lifecycle_kind(N::KIND, signal.label());
        let mut action = Action::new(kind).with_id(key);
        if let Signal::Compiled(value) = signal {
            action = action.with_payload(value.as_ref().clone());
        }
        self.bus.publish(action);

        if global {
            self.publish_global(key, signal);
        }
    }

    fn publish_global(&self, key: &str, signal: &Signal) {
        self.bus.publish(
            Action::new(lifecycle_kind(N::KIND, signal.label())).with_payload(json!({ "id": key })),
        );
    }

    fn publish_error(&self, label: &str, key: &str, err: &EngineError) {
        let mut payload = json!({
            "id": key,
            "code": err.code(),
            "message": err.to_string(),
        });
        if let EngineError::RuleVerificationFailure(report) = err {
            if let Ok(report) = serde_json::to_value(&**report) {
                payload["report"] = report;
            }
        }
        self.bus
            .publish(Action::new(lifecycle_kind(N::KIND, label)).with_payload(payload));
    }

    fn fail<T>(&self, label: &str, key: &str, err: EngineError) -> Result<T> {
        debug!("{} {} rejected: {}", N::KIND, key, err);
        self.publish_error(label, key, &err);
        Err(err)
    }
}

impl Registry<EntitlementNode> {
    /// Current flags of an entitlement
    pub fn flags(&self, key: &str) -> Option<Flags> {
        self.nodes.get(key).map(EntitlementNode::state)
    }
}

impl Registry<ProfileNode> {
    pub fn state(&self, key: &str) -> Option<ProfileState> {
        self.nodes.get(key).map(ProfileNode::state)
    }
}

impl<N: Node> std::fmt::Debug for Registry<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &N::KIND)
            .field("nodes", &self.nodes.len())
            .field("channels", &self.listeners.len())
            .field("pending", &self.outbox.len())
            .finish()
    }
}
