//! Branch node - route by the first matching condition path.

use async_trait::async_trait;

use super::types::{kind_mismatch, NodeContext, NodeExecutor, StepOutcome};
use crate::automation::{NodeKind, NodeType};
use crate::error::Result;

pub struct BranchExecutor;

#[async_trait]
impl NodeExecutor for BranchExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Branch
    }

    fn description(&self) -> &str {
        "Follow the first path whose conditions match, else the default path"
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<StepOutcome> {
        let NodeKind::Branch(config) = &ctx.node.kind else {
            return Err(kind_mismatch(NodeType::Branch, ctx.node));
        };

        let evaluator = &ctx.services.evaluator;
        let target = config
            .paths
            .iter()
            .find(|path| evaluator.evaluate(&path.conditions, &ctx.run.context))
            .map(|path| path.next_node_id.as_ref())
            .unwrap_or(config.default_path_id.as_ref());

        Ok(StepOutcome::advance(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{BranchConfig, BranchPath, Node};
    use crate::conditions::Condition;
    use crate::nodes::testing::Fixture;
    use serde_json::json;

    fn branch(default: Option<&str>) -> Node {
        Node::new(
            "split",
            NodeKind::Branch(BranchConfig {
                paths: vec![
                    BranchPath {
                        conditions: Condition::leaf("equals", "country", json!("FR")),
                        next_node_id: Some("fr".into()),
                    },
                    BranchPath {
                        conditions: Condition::leaf("gt", "orders", json!(1)),
                        next_node_id: Some("loyal".into()),
                    },
                ],
                default_path_id: default.map(String::from),
            }),
        )
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let fx = Fixture::with_context(json!({"changes": {"country": "FR", "orders": 3}})).await;
        let node = branch(Some("other"));
        let outcome = BranchExecutor.execute(&fx.ctx(&node)).await.unwrap();
        assert_eq!(outcome, StepOutcome::Advance { next: Some("fr".into()) });
    }

    #[tokio::test]
    async fn test_later_path_matches() {
        let fx = Fixture::with_context(json!({"changes": {"country": "DE", "orders": 3}})).await;
        let node = branch(Some("other"));
        let outcome = BranchExecutor.execute(&fx.ctx(&node)).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Advance {
                next: Some("loyal".into())
            }
        );
    }

    #[tokio::test]
    async fn test_default_path() {
        let fx = Fixture::with_context(json!({"changes": {"country": "DE"}})).await;
        let node = branch(Some("other"));
        let outcome = BranchExecutor.execute(&fx.ctx(&node)).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Advance {
                next: Some("other".into())
            }
        );
    }

    #[tokio::test]
    async fn test_no_match_without_default_completes() {
        let fx = Fixture::with_context(json!({"changes": {"country": "DE"}})).await;
        let node = branch(Some(""));
        let outcome = BranchExecutor.execute(&fx.ctx(&node)).await.unwrap();
        assert_eq!(outcome, StepOutcome::Advance { next: None });
    }
}
