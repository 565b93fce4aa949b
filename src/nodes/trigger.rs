//! Trigger node: entry point of every automation.

use async_trait::async_trait;

use super::types::{NodeContext, NodeExecutor, StepOutcome};
use crate::automation::NodeType;
use crate::error::Result;

pub struct TriggerExecutor;

#[async_trait]
impl NodeExecutor for TriggerExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Trigger
    }

    fn description(&self) -> &str {
        "Entry point; passes straight through to its successor"
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<StepOutcome> {
        Ok(StepOutcome::advance(ctx.node.next_node_id.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{Node, NodeKind};
    use crate::nodes::testing::Fixture;

    #[tokio::test]
    async fn test_trigger_advances() {
        let fx = Fixture::new().await;
        let node = Node::new("start", NodeKind::Trigger).with_next("send");
        let outcome = TriggerExecutor.execute(&fx.ctx(&node)).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Advance {
                next: Some("send".into())
            }
        );
    }

    #[tokio::test]
    async fn test_trigger_without_successor_completes() {
        let fx = Fixture::new().await;
        let node = Node::new("start", NodeKind::Trigger);
        let outcome = TriggerExecutor.execute(&fx.ctx(&node)).await.unwrap();
        assert_eq!(outcome, StepOutcome::Advance { next: None });
    }
}
