//! Compliance rule engine
//!
//! Schemas register, per entry path, the rules a value at that path must
//! satisfy and any rules the entry defines itself. Bare rule names resolve
//! by scope: the defining entry closest to the verified path wins, the way
//! lexical scoping works. Dotted names address built-in modules directly.

pub mod convert;
pub mod report;
pub mod rules;
pub mod sandbox;
pub mod schema;


use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::{EngineError, Result};

pub use report::{ComplianceReport, EntryViolations, Violation, ViolationReason};
pub use rules::{builtin_modules, BuiltinFn, Executable, Rule, RulesModule};
pub use sandbox::{CelSandbox, SandboxError, SandboxExecutor, ScriptHandle, ScriptSandbox};
pub use schema::{Comply, RuleArg, RuleDefinition, RuleRef, SchemaNode};

/// Checks a compiled value against the rules of its resource
pub trait Verifier: Send + Sync {
    fn verify(&self, resource: &str, value: &Value) -> Result<()>;
}

type Builtins = DashMap<(String, String), Arc<Rule>>;

/// Hierarchical rule cache plus rule execution
pub struct ComplianceEngine {
    builtins: Arc<Builtins>,
    /// User rules keyed by `[...entry path, rule name]`
    rules: DashMap<Vec<String>, Arc<Rule>>,
    /// Rule references keyed by entry path
    comply: DashMap<Vec<String>, Arc<Vec<RuleRef>>>,
    schemas: DashSet<String>,
    sandbox: Arc<SandboxExecutor>,
}

impl ComplianceEngine {
    /// Engine with the built-in modules and a CEL sandbox
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_executor(Arc::new(SandboxExecutor::new(config)))
    }

    pub fn with_executor(sandbox: Arc<SandboxExecutor>) -> Self {
        let engine = Self {
            builtins: Arc::new(DashMap::new()),
            rules: DashMap::new(),
            comply: DashMap::new(),
            schemas: DashSet::new(),
            sandbox,
        };
        for module in builtin_modules() {
            engine.register_module(module);
        }
        engine
    }

    /// Engine sharing built-ins and sandbox with `self` but nothing loaded
    fn scratch(&self) -> Self {
        Self {
            builtins: Arc::clone(&self.builtins),
            rules: DashMap::new(),
            comply: DashMap::new(),
            schemas: DashSet::new(),
            sandbox: Arc::clone(&self.sandbox),
        }
    }

    /// Register a module of native rules, replacing same-named rules
    pub fn register_module(&self, module: RulesModule) {
        debug!("Registering {} rules of module {}", module.rules.len(), module.module);
        for rule in module.rules {
            self.builtins
                .insert((module.module.clone(), rule.name.clone()), Arc::new(rule));
        }
    }

    pub fn builtin(&self, module: &str, name: &str) -> Option<Arc<Rule>> {
        self.builtins
            .get(&(module.to_string(), name.to_string()))
            .map(|rule| Arc::clone(rule.value()))
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.schemas.contains(name)
    }

    /// Load a schema tree, replacing any schema of the same name
    ///
    /// All rule bodies are compiled before anything is stored, so a failing
    /// rule leaves the previously loaded caches untouched.
    pub fn load_schema(&self, schema: &SchemaNode) -> Result<()> {
        let mut comply = Vec::new();
        let mut rules = Vec::new();
        let mut stack = vec![(vec![schema.name.clone()], schema)];

        while let Some((path, node)) = stack.pop() {
            if node.name.is_empty() {
                return Err(EngineError::InvalidDefinition(format!(
                    "schema \"{}\" has an unnamed entry under {:?}",
                    schema.name, path
                )));
            }

            if let Some(block) = &node.comply {
                comply.push((path.clone(), Arc::new(block.rules.clone())));

                for definition in &block.define {
                    let handle = self.sandbox.compile(&definition.body).map_err(|e| {
                        EngineError::RuleCompileFailure {
                            schema: schema.name.clone(),
                            path: path.clone(),
                            rule: definition.name.clone(),
                            source_text: definition.body.clone(),
                            cause: e.to_string(),
                        }
                    })?;

                    let mut key = path.clone();
                    key.push(definition.name.clone());
                    rules.push((key, Arc::new(Rule::scripted(definition, handle))));
                }
            }

            for child in node.children.iter().rev() {
                let mut child_path = path.clone();
                child_path.push(child.name.clone());
                stack.push((child_path, child));
            }
        }

        // Overwrite in place, then drop what the new version no longer has;
        // readers never find the schema missing mid-reload
        let (entries, defined) = (comply.len(), rules.len());
        let comply_keys: HashSet<Vec<String>> =
            comply.iter().map(|(path, _)| path.clone()).collect();
        let rule_keys: HashSet<Vec<String>> = rules.iter().map(|(key, _)| key.clone()).collect();
        for (path, refs) in comply {
            self.comply.insert(path, refs);
        }
        for (key, rule) in rules {
            self.rules.insert(key, rule);
        }
        self.schemas.insert(schema.name.clone());

        let stale = |key: &Vec<String>, fresh: &HashSet<Vec<String>>| {
            key.first() == Some(&schema.name) && !fresh.contains(key)
        };
        self.comply.retain(|key, _| !stale(key, &comply_keys));
        self.rules.retain(|key, _| !stale(key, &rule_keys));

        info!(
            "Loaded schema {} ({} entries with rules, {} defined rules)",
            schema.name, entries, defined
        );
        Ok(())
    }

    /// Drop every rule and reference under a schema root
    pub fn unload_schema(&self, name: &str) -> bool {
        let in_schema = |key: &Vec<String>| key.first().map(String::as_str) == Some(name);
        self.comply.retain(|key, _| !in_schema(key));
        self.rules.retain(|key, _| !in_schema(key));
        self.schemas.remove(name).is_some()
    }

    /// Scope search: the longest prefix of `path` defining `name`
    pub fn find_rule<S: AsRef<str>>(&self, path: &[S], name: &str) -> Option<Vec<String>> {
        let mut key: Vec<String> = path.iter().map(|s| s.as_ref().to_string()).collect();
        key.push(name.to_string());

        while key.len() > 1 {
            if self.rules.contains_key(&key) {
                key.pop();
                return Some(key);
            }
            // Drop the last path segment, keeping the rule name at the end
            let rule = key.pop()?;
            key.pop();
            key.push(rule);
        }
        None
    }

    /// Resolve a reference seen at `path` to the rule and where it lives
    fn resolve(&self, path: &[String], reference: &RuleRef) -> Option<(Vec<String>, Arc<Rule>)> {
        if reference.is_qualified() {
            let segments: Vec<String> = reference.name.split('.').map(str::to_string).collect();
            if let [module, name] = segments.as_slice() {
                if let Some(rule) = self.builtin(module, name) {
                    return Some((vec![module.clone()], rule));
                }
            }
            let rule = self.rules.get(&segments).map(|r| Arc::clone(r.value()))?;
            let mut rule_path = segments;
            rule_path.pop();
            return Some((rule_path, rule));
        }

        let rule_path = self.find_rule(path, &reference.name)?;
        let mut key = rule_path.clone();
        key.push(reference.name.clone());
        let rule = self.rules.get(&key).map(|r| Arc::clone(r.value()))?;
        Some((rule_path, rule))
    }

    fn execute(&self, rule: &Rule, value: &Value, args: &[Value]) -> std::result::Result<bool, String> {
        match &rule.executable {
            Executable::Builtin(body) => body(value, args),
            Executable::Script(handle) => self
                .sandbox
                .evaluate(handle, value, args)
                .map_err(|e| e.to_string()),
        }
    }

    /// Run every rule registered at `path` against `value`
    ///
    /// Does not stop at the first failure; every broken rule is reported.
    pub fn verify_entry_compliance(&self, path: &[String], value: &Value) -> Vec<Violation> {
        let Some(references) = self.comply.get(path).map(|r| Arc::clone(r.value())) else {
            return Vec::new();
        };

        let mut violations = Vec::new();
        for reference in references.iter() {
            let violation = |rule_path: Vec<String>, reason: ViolationReason| Violation {
                path: path.to_vec(),
                rule_path,
                rule: reference.to_string(),
                value: value.clone(),
                reason,
            };

            let Some((rule_path, rule)) = self.resolve(path, reference) else {
                warn!("Rule {} referenced at {:?} does not exist", reference.name, path);
                violations.push(violation(Vec::new(), ViolationReason::Unresolved));
                continue;
            };

            match self.execute(&rule, value, &reference.args) {
                Ok(true) => {}
                Ok(false) => {
                    violations.push(violation(rule_path, ViolationReason::Failed(rule.failure_text())))
                }
                Err(e) => {
                    warn!("Rule {} at {:?} errored: {}", reference, path, e);
                    violations.push(violation(rule_path, ViolationReason::Errored(e)));
                }
            }
        }
        violations
    }

    /// Check every leaf of `value` against the rules at its path
    ///
    /// Objects are walked; anything else, arrays included, is a leaf.
    pub fn verify_entitlements_compliance(
        &self,
        value: &Value,
        resource: &str,
    ) -> Vec<EntryViolations> {
        let mut found = Vec::new();
        let Value::Object(root) = value else {
            return found;
        };

        let mut stack: Vec<(Vec<String>, &Value)> = root
            .iter()
            .rev()
            .map(|(key, child)| (vec![resource.to_string(), key.clone()], child))
            .collect();

        while let Some((path, current)) = stack.pop() {
            match current {
                Value::Object(object) => {
                    for (key, child) in object.iter().rev() {
                        let mut child_path = path.clone();
                        child_path.push(key.clone());
                        stack.push((child_path, child));
                    }
                }
                leaf => {
                    let violations = self.verify_entry_compliance(&path, leaf);
                    if !violations.is_empty() {
                        found.push(EntryViolations { path, violations });
                    }
                }
            }
        }
        found
    }

    /// Rules registered at the schema root, applied to the whole value
    pub fn verify_root_compliance(&self, value: &Value, resource: &str) -> Vec<Violation> {
        self.verify_entry_compliance(&[resource.to_string()], value)
    }

    /// Root and entry compliance together
    pub fn report(&self, value: &Value, resource: &str) -> ComplianceReport {
        let report = ComplianceReport {
            root: self.verify_root_compliance(value, resource),
            entries: self.verify_entitlements_compliance(value, resource),
        };
        debug!("Verified {} value: {} violation(s)", resource, report.len());
        report
    }

    /// Verify `value` against `schema` without loading it into this engine
    pub fn verify_schema_compliance(
        &self,
        schema: &SchemaNode,
        value: &Value,
    ) -> Result<ComplianceReport> {
        let scratch = self.scratch();
        scratch.load_schema(schema)?;
        Ok(scratch.report(value, &schema.name))
    }
}

impl Default for ComplianceEngine {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

impl Verifier for ComplianceEngine {
    fn verify(&self, resource: &str, value: &Value) -> Result<()> {
        if !self.has_schema(resource) {
            return Ok(());
        }

        let report = self.report(value, resource);
        if report.is_empty() {
            Ok(())
        } else {
            Err(EngineError::RuleVerificationFailure(Box::new(report)))
        }
    }
}

impl fmt::Debug for ComplianceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComplianceEngine")
            .field("builtins", &self.builtins.len())
            .field("rules", &self.rules.len())
            .field("entries", &self.comply.len())
            .field("sandbox", &self.sandbox)
            .finish()
    }
}
