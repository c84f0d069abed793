//! Compiler: turns a node's dependencies and payload layers into one value
//!
//! The compiler keeps its own cache of compiled values keyed by node id.
//! Compiling a node reads its dependencies from that cache, so callers must
//! only ask for a compile once every dependency has been compiled.

pub mod merge;
pub mod remote;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{EngineError, Result};

/// Everything the compiler needs to build one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileJob {
    /// Node id, also the cache key of the result
    pub id: String,

    /// Registry generation the job was issued for
    #[serde(default)]
    pub generation: u64,

    /// Dependency ids, in declared order
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// The node's own payload layers, merged after the dependencies
    #[serde(default)]
    pub layers: Vec<Value>,
}

/// Compiler cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilerStats {
    pub entries: usize,
    pub compilations: u64,
    pub failures: u64,
    pub evictions: u64,
}

/// Merge compiler with a compiled-value cache
#[derive(Debug, Default)]
pub struct Compiler {
    cache: DashMap<String, Arc<Value>>,
    compilations: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile a job and cache the result under its id
    ///
    /// Layers apply in order: each dependency's compiled value as declared,
    /// then the job's own layers.
    ///
    /// # Errors
    ///
    /// [`EngineError::MissingDependency`] if any dependency has no cached
    /// value. Nothing is cached in that case.
    pub fn compile(&self, job: &CompileJob) -> Result<Arc<Value>> {
        let mut resolved = Vec::with_capacity(job.dependencies.len());
        let mut missing = Vec::new();

        for dependency in &job.dependencies {
            match self.cache.get(dependency) {
                Some(entry) => resolved.push(Arc::clone(entry.value())),
                None => missing.push(dependency.clone()),
            }
        }

        if !missing.is_empty() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            debug!(id = %job.id, ?missing, "Compile deferred, dependencies not compiled");
            return Err(EngineError::MissingDependency {
                key: job.id.clone(),
                missing,
            });
        }

        let merged = merge::merge_layers(
            resolved
                .iter()
                .map(|value| value.as_ref())
                .chain(job.layers.iter()),
        );
        let compiled = Arc::new(merged);

        self.cache.insert(job.id.clone(), Arc::clone(&compiled));
        self.compilations.fetch_add(1, Ordering::Relaxed);
        trace!(id = %job.id, generation = job.generation, "Compiled");

        Ok(compiled)
    }

    /// Cached value of a node
    pub fn get(&self, id: &str) -> Option<Arc<Value>> {
        self.cache.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cache.contains_key(id)
    }

    /// Store a value produced elsewhere, e.g. by a remote worker
    pub fn publish(&self, id: impl Into<String>, value: Arc<Value>) {
        self.cache.insert(id.into(), value);
    }

    /// Drop cached values; returns how many were present
    pub fn evict<S: AsRef<str>>(&self, ids: &[S]) -> usize {
        let removed = ids
            .iter()
            .filter(|id| self.cache.remove(id.as_ref()).is_some())
            .count();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop every cached value
    pub fn clear(&self) {
        let removed = self.cache.len();
        self.cache.clear();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> CompilerStats {
        CompilerStats {
            entries: self.cache.len(),
            compilations: self.compilations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(id: &str, deps: &[&str], layers: Vec<Value>) -> CompileJob {
        CompileJob {
            id: id.to_string(),
            generation: 0,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            layers,
        }
    }

    #[test]
    fn test_compile_root() {
        let compiler = Compiler::new();
        let value = compiler
            .compile(&job("root", &[], vec![json!({"a": 1})]))
            .unwrap();

        assert_eq!(*value, json!({"a": 1}));
        assert_eq!(compiler.get("root").as_deref(), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_dependencies_merge_in_declared_order() {
        let compiler = Compiler::new();
        compiler.compile(&job("x", &[], vec![json!({"v": "x", "x": true})])).unwrap();
        compiler.compile(&job("y", &[], vec![json!({"v": "y"})])).unwrap();

        let value = compiler.compile(&job("z", &["x", "y"], vec![])).unwrap();
        assert_eq!(*value, json!({"v": "y", "x": true}));

        let value = compiler.compile(&job("z", &["y", "x"], vec![])).unwrap();
        assert_eq!(*value, json!({"v": "x", "x": true}));
    }

    #[test]
    fn test_layers_follow_dependencies() {
        let compiler = Compiler::new();
        compiler.compile(&job("root", &[], vec![json!({"a": 1, "b": 1})])).unwrap();

        let value = compiler
            .compile(&job(
                "ent",
                &["root"],
                vec![json!({"a": 2}), json!({"b": {"$unset": true}, "c": 3})],
            ))
            .unwrap();
        assert_eq!(*value, json!({"a": 2, "b": 1, "c": 3}));
    }

    #[test]
    fn test_missing_dependency_is_not_cached() {
        let compiler = Compiler::new();
        let err = compiler
            .compile(&job("child", &["parent"], vec![json!({})]))
            .unwrap_err();

        match err {
            EngineError::MissingDependency { key, missing } => {
                assert_eq!(key, "child");
                assert_eq!(missing, vec!["parent".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!compiler.contains("child"));
        assert_eq!(compiler.stats().failures, 1);
    }

    #[test]
    fn test_evict_and_clear() {
        let compiler = Compiler::new();
        compiler.compile(&job("a", &[], vec![])).unwrap();
        compiler.compile(&job("b", &[], vec![])).unwrap();

        assert_eq!(compiler.evict(&["a", "missing"]), 1);
        assert!(!compiler.contains("a"));

        compiler.clear();
        assert!(compiler.is_empty());
        assert_eq!(compiler.stats().evictions, 2);
    }
}
