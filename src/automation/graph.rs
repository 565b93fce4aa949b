//! Indexed node arena for an automation.
//!
//! Nodes are loaded once into a vector and resolved by id through an index,
//! so a graph can be shared across worker tasks behind an `Arc` and still
//! serializes as a plain list.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::types::Node;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Node>", into = "Vec<Node>")]
pub struct NodeGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl NodeGraph {
    /// Build a graph, rejecting empty or duplicate node ids.
    pub fn new(nodes: Vec<Node>) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (position, node) in nodes.iter().enumerate() {
            if node.id.is_empty() {
                return Err(Error::Validation("Node ID cannot be empty".into()));
            }
            if index.insert(node.id.clone(), position).is_some() {
                return Err(Error::Validation(format!("Duplicate node ID: {}", node.id)));
            }
        }
        Ok(Self { nodes, index })
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// First successor reference that points outside the graph, if any.
    pub fn dangling_reference(&self) -> Option<(&str, &str)> {
        self.nodes.iter().find_map(|node| {
            node.successors()
                .into_iter()
                .find(|target| !self.contains(target))
                .map(|target| (node.id.as_str(), target))
        })
    }

    /// Returns the id of a node that sits on a cycle, if the graph has one.
    ///
    /// Depth-first with an explicit stack, so chain length is bounded by
    /// memory rather than by the thread's stack.
    pub fn find_cycle(&self) -> Option<&str> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnPath,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path: Vec<(usize, Vec<usize>)> = Vec::new();

        for root in 0..self.nodes.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            marks[root] = Mark::OnPath;
            path.push((root, self.successor_positions(root)));

            while let Some((position, pending)) = path.last_mut() {
                let position = *position;
                match pending.pop() {
                    None => {
                        marks[position] = Mark::Done;
                        path.pop();
                    }
                    Some(next) => match marks[next] {
                        Mark::OnPath => return Some(self.nodes[next].id.as_str()),
                        Mark::Done => {}
                        Mark::Unvisited => {
                            marks[next] = Mark::OnPath;
                            path.push((next, self.successor_positions(next)));
                        }
                    },
                }
            }
        }
        None
    }

    /// Positions of a node's successors, skipping dangling references.
    fn successor_positions(&self, position: usize) -> Vec<usize> {
        self.nodes[position]
            .successors()
            .into_iter()
            .filter_map(|id| self.index.get(id).copied())
            .collect()
    }
}

impl TryFrom<Vec<Node>> for NodeGraph {
    type Error = Error;

    fn try_from(nodes: Vec<Node>) -> Result<Self> {
        NodeGraph::new(nodes)
    }
}

impl From<NodeGraph> for Vec<Node> {
    fn from(graph: NodeGraph) -> Self {
        graph.nodes
    }
}
