//! Dependency edges of a registry, kept for validation
//!
//! The registry refuses any add or update that would close a cycle. The check
//! walks the edges depth first with three colours: white (unvisited), gray
//! (on the current path) and black (done). Reaching a gray node means a cycle.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::error::EngineError;

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),

    #[error("Node [\"{node}\"] lists \"{dependency}\" more than once")]
    DuplicateDependency { node: String, dependency: String },

    #[error("Invalid node: {0}")]
    InvalidNode(String),
}

impl From<GraphError> for EngineError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::CircularDependency(cycle) => EngineError::CyclicDependency(cycle),
            other => EngineError::InvalidDefinition(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    Gray,
    Black,
}

/// Adjacency list: node id to the ids it depends on
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject empty keys, self references and duplicates
    pub fn validate_node(key: &str, dependencies: &[String]) -> Result<(), GraphError> {
        if key.is_empty() {
            return Err(GraphError::InvalidNode("key must not be empty".to_string()));
        }

        let mut seen = HashSet::with_capacity(dependencies.len());
        for dependency in dependencies {
            if dependency == key {
                return Err(GraphError::CircularDependency(format!("{key} -> {key}")));
            }
            if !seen.insert(dependency.as_str()) {
                return Err(GraphError::DuplicateDependency {
                    node: key.to_string(),
                    dependency: dependency.clone(),
                });
            }
        }

        Ok(())
    }

    /// Check that giving `key` these dependencies keeps the graph acyclic
    ///
    /// Dependencies that are not registered yet simply end the walk; they
    /// can not close a cycle until they are added, and that add is checked
    /// in turn.
    pub fn check<'a>(&'a self, key: &'a str, dependencies: &'a [String]) -> Result<(), GraphError> {
        Self::validate_node(key, dependencies)?;

        let mut colour: HashMap<&str, Colour> = HashMap::new();
        let mut path: Vec<&str> = vec![key];
        // Next child index to visit for each node on the path
        let mut cursor: Vec<usize> = vec![0];
        colour.insert(key, Colour::Gray);

        while let Some(node) = path.last().copied() {
            let children = self.edges_of(node, key, dependencies);
            let index = cursor.last().copied().unwrap_or(children.len());

            if index >= children.len() {
                colour.insert(node, Colour::Black);
                path.pop();
                cursor.pop();
                continue;
            }

            if let Some(next) = cursor.last_mut() {
                *next += 1;
            }

            let child = children[index].as_str();
            match colour.get(child) {
                Some(Colour::Gray) => {
                    let start = path.iter().position(|n| *n == child).unwrap_or(0);
                    let mut cycle: Vec<&str> = path[start..].to_vec();
                    cycle.push(child);
                    return Err(GraphError::CircularDependency(cycle.join(" -> ")));
                }
                Some(Colour::Black) => {}
                None => {
                    colour.insert(child, Colour::Gray);
                    path.push(child);
                    cursor.push(0);
                }
            }
        }

        Ok(())
    }

    fn edges_of<'a>(&'a self, node: &str, key: &str, dependencies: &'a [String]) -> &'a [String] {
        if node == key {
            dependencies
        } else {
            self.edges.get(node).map(Vec::as_slice).unwrap_or(&[])
        }
    }

    /// Record or replace a node's edges
    pub fn insert(&mut self, key: impl Into<String>, dependencies: Vec<String>) {
        self.edges.insert(key.into(), dependencies);
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.edges.remove(key)
    }

    pub fn dependencies(&self, key: &str) -> Option<&[String]> {
        self.edges.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_chain_is_accepted() {
        let mut graph = DependencyGraph::new();
        graph.insert("root", deps(&[]));
        graph.insert("team", deps(&["root"]));

        assert!(graph.check("user", &deps(&["team", "root"])).is_ok());
    }

    #[test]
    fn test_self_dependency() {
        let graph = DependencyGraph::new();
        let err = graph.check("a", &deps(&["a"])).unwrap_err();
        assert_eq!(err, GraphError::CircularDependency("a -> a".to_string()));
    }

    #[test]
    fn test_indirect_cycle_reports_path() {
        let mut graph = DependencyGraph::new();
        graph.insert("a", deps(&["b"]));
        graph.insert("b", deps(&["c"]));
        graph.insert("c", deps(&[]));

        let err = graph.check("c", &deps(&["a"])).unwrap_err();
        assert_eq!(
            err,
            GraphError::CircularDependency("c -> a -> b -> c".to_string())
        );
    }

    #[test]
    fn test_unregistered_dependency_ends_walk() {
        let mut graph = DependencyGraph::new();
        graph.insert("a", deps(&["ghost"]));
        assert!(graph.check("b", &deps(&["a", "ghost"])).is_ok());
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.insert("root", deps(&[]));
        graph.insert("left", deps(&["root"]));
        graph.insert("right", deps(&["root"]));
        assert!(graph.check("bottom", &deps(&["left", "right"])).is_ok());
    }

    #[test]
    fn test_duplicate_dependency() {
        let graph = DependencyGraph::new();
        let err = graph.check("a", &deps(&["b", "b"])).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateDependency { .. }));
    }

    #[test]
    fn test_error_conversion() {
        let err: EngineError = GraphError::CircularDependency("a -> a".to_string()).into();
        assert!(matches!(err, EngineError::CyclicDependency(_)));

        let err: EngineError = GraphError::InvalidNode("empty".to_string()).into();
        assert_eq!(err.code(), "invalid_definition");
    }
}
