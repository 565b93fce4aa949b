//! Executor registry, one executor per node type.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::NodeExecutor;
use super::{
    AbTestExecutor, AddToListExecutor, BranchExecutor, DelayExecutor, EmailExecutor,
    FilterExecutor, ListStatusBranchExecutor, RemoveFromListExecutor, TriggerExecutor,
};
use crate::automation::NodeType;

/// Registry of node executors.
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    /// Create a registry with every built-in executor.
    pub fn new() -> Self {
        let mut registry = Self::empty();

        registry.register(Arc::new(TriggerExecutor));
        registry.register(Arc::new(EmailExecutor));
        registry.register(Arc::new(DelayExecutor));
        registry.register(Arc::new(BranchExecutor));
        registry.register(Arc::new(FilterExecutor));
        registry.register(Arc::new(AbTestExecutor));
        registry.register(Arc::new(ListStatusBranchExecutor));
        registry.register(Arc::new(AddToListExecutor));
        registry.register(Arc::new(RemoveFromListExecutor));

        registry
    }

    /// Create an empty registry (for testing).
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor, replacing any previous one for its type.
    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(executor.node_type(), executor);
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type).cloned()
    }

    pub fn has(&self, node_type: NodeType) -> bool {
        self.executors.contains_key(&node_type)
    }

    /// Registered node types with their descriptions, in declaration order.
    pub fn list(&self) -> Vec<(NodeType, &str)> {
        NodeType::ALL
            .iter()
            .filter_map(|t| self.executors.get(t).map(|e| (*t, e.description())))
            .collect()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_node_type_has_an_executor() {
        let registry = ExecutorRegistry::new();
        for node_type in NodeType::ALL {
            assert!(registry.has(node_type), "missing executor for {}", node_type);
            assert_eq!(registry.get(node_type).unwrap().node_type(), node_type);
        }
        assert_eq!(registry.list().len(), NodeType::ALL.len());
    }

    #[test]
    fn test_empty_registry() {
        let registry = ExecutorRegistry::empty();
        assert!(!registry.has(NodeType::Email));
        assert!(registry.get(NodeType::Email).is_none());
    }
}
