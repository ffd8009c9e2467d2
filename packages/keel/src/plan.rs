//! Task graphs: the plan a job executes.
//!
//! Nodes reference each other by id strings; there are no pointer cycles in
//! persistent state. The executor resolves readiness from `depends_on`
//! against the set of completed node ids.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Expected unblock source for a waiting node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Webhook,
    Human,
    Timer,
    Signal,
    Message,
}

impl WaitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitKind::Webhook => "webhook",
            WaitKind::Human => "human",
            WaitKind::Timer => "timer",
            WaitKind::Signal => "signal",
            WaitKind::Message => "message",
        }
    }
}

/// Classification carried on `node_finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeResultType {
    Success,
    Failure,
    Cancelled,
}

impl NodeResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeResultType::Success => "success",
            NodeResultType::Failure => "failure",
            NodeResultType::Cancelled => "cancelled",
        }
    }
}

/// One unit of the plan. The core does not know what a node computes; `kind`
/// routes to a registered handler and `config` is the handler's own business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            depends_on: Vec::new(),
            config: serde_json::Value::Null,
        }
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// The plan: an ordered list of nodes plus dependency edges by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskGraph {
    pub nodes: Vec<TaskNode>,
}

/// Structural problems a plan can have.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),
    #[error("node {node} depends on unknown node {dep}")]
    UnknownDependency { node: String, dep: String },
    #[error("dependency cycle involving node {0}")]
    Cycle(String),
}

impl TaskGraph {
    pub fn new(nodes: Vec<TaskNode>) -> Self {
        Self { nodes }
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The next runnable node in declaration order: not yet completed, with
    /// every dependency completed. Execution inside a worker is cooperative
    /// and sequential, so one node at a time is the contract.
    pub fn next_ready<'a>(&'a self, completed: &BTreeSet<String>) -> Option<&'a TaskNode> {
        self.nodes.iter().find(|n| {
            !completed.contains(&n.id) && n.depends_on.iter().all(|d| completed.contains(d))
        })
    }

    /// True when every node id is in `completed`.
    pub fn is_complete(&self, completed: &BTreeSet<String>) -> bool {
        self.nodes.iter().all(|n| completed.contains(&n.id))
    }

    /// Reject duplicate ids, unknown dependencies, and cycles.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(PlanError::DuplicateNodeId(node.id.clone()));
            }
        }
        for node in &self.nodes {
            for dep in &node.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        node: node.id.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }
        // Kahn's algorithm over the id arena; leftovers mean a cycle.
        let mut remaining: Vec<&TaskNode> = self.nodes.iter().collect();
        let mut done: BTreeSet<String> = BTreeSet::new();
        loop {
            let before = remaining.len();
            remaining.retain(|n| {
                if n.depends_on.iter().all(|d| done.contains(d)) {
                    done.insert(n.id.clone());
                    false
                } else {
                    true
                }
            });
            if remaining.is_empty() {
                return Ok(());
            }
            if remaining.len() == before {
                return Err(PlanError::Cycle(remaining[0].id.clone()));
            }
        }
    }

    /// Hash of the canonical serialization, carried on `plan_generated` and
    /// folded into the execution hash.
    pub fn plan_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}
