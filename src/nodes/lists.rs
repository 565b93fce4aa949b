//! List nodes - branch on and change list membership.

use async_trait::async_trait;
use tracing::debug;

use super::types::{kind_mismatch, NodeContext, NodeExecutor, StepOutcome};
use crate::automation::{ListStatus, NodeKind, NodeType};
use crate::error::Result;

/// Routes on the contact's status in one list.
pub struct ListStatusBranchExecutor;

#[async_trait]
impl NodeExecutor for ListStatusBranchExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::ListStatusBranch
    }

    fn description(&self) -> &str {
        "Branch on the contact's membership status in a list"
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<StepOutcome> {
        let NodeKind::ListStatusBranch(config) = &ctx.node.kind else {
            return Err(kind_mismatch(NodeType::ListStatusBranch, ctx.node));
        };

        let status = ctx
            .services
            .lists
            .get_status(&ctx.run.workspace_id, &ctx.run.contact_email, &config.list_id)
            .await?;

        let target = match status {
            None => config.not_in_list_node_id.as_ref(),
            Some(ListStatus::Active) => config.active_node_id.as_ref(),
            Some(_) => config.non_active_node_id.as_ref(),
        };
        Ok(StepOutcome::advance(target))
    }
}

/// Subscribes the contact to a list.
pub struct AddToListExecutor;

#[async_trait]
impl NodeExecutor for AddToListExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::AddToList
    }

    fn description(&self) -> &str {
        "Add the contact to a list (active unless a status is given)"
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<StepOutcome> {
        let NodeKind::AddToList(config) = &ctx.node.kind else {
            return Err(kind_mismatch(NodeType::AddToList, ctx.node));
        };
        let status = config.status.unwrap_or(ListStatus::Active);
        set_membership(ctx, &config.list_id, status).await
    }
}

/// Takes the contact off a list by moving it to a non-active status.
pub struct RemoveFromListExecutor;

#[async_trait]
impl NodeExecutor for RemoveFromListExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::RemoveFromList
    }

    fn description(&self) -> &str {
        "Remove the contact from a list (unsubscribed unless a status is given)"
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<StepOutcome> {
        let NodeKind::RemoveFromList(config) = &ctx.node.kind else {
            return Err(kind_mismatch(NodeType::RemoveFromList, ctx.node));
        };
        let status = config.status.unwrap_or(ListStatus::Unsubscribed);
        set_membership(ctx, &config.list_id, status).await
    }
}

async fn set_membership(
    ctx: &NodeContext<'_>,
    list_id: &str,
    status: ListStatus,
) -> Result<StepOutcome> {
    ctx.services
        .lists
        .set_status(&ctx.run.workspace_id, &ctx.run.contact_email, list_id, status)
        .await?;
    debug!(run_id = %ctx.run.id, list_id = %list_id, status = %status, "List membership updated");
    Ok(StepOutcome::advance(ctx.node.next_node_id.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{ListMembershipConfig, ListStatusBranchConfig, Node};
    use crate::error::Error;
    use crate::nodes::testing::Fixture;
    use crate::services::ContactLists;

    fn status_branch(list_id: &str) -> Node {
        Node::new(
            "check",
            NodeKind::ListStatusBranch(ListStatusBranchConfig {
                list_id: list_id.into(),
                active_node_id: Some("active".into()),
                non_active_node_id: Some("lapsed".into()),
                not_in_list_node_id: Some("stranger".into()),
            }),
        )
    }

    async fn branch_target(fx: &Fixture) -> Option<String> {
        let node = status_branch("news");
        match ListStatusBranchExecutor.execute(&fx.ctx(&node)).await.unwrap() {
            StepOutcome::Advance { next } => next,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_branch_routes_three_ways() {
        let fx = Fixture::new().await;
        assert_eq!(branch_target(&fx).await.as_deref(), Some("stranger"));

        fx.storage
            .set_status("ws-1", "a@x.com", "news", ListStatus::Active)
            .await
            .unwrap();
        assert_eq!(branch_target(&fx).await.as_deref(), Some("active"));

        fx.storage
            .set_status("ws-1", "a@x.com", "news", ListStatus::Bounced)
            .await
            .unwrap();
        assert_eq!(branch_target(&fx).await.as_deref(), Some("lapsed"));
    }

    #[tokio::test]
    async fn test_missing_list_is_configuration_error() {
        let fx = Fixture::new().await;
        let node = status_branch("gone");
        let err = ListStatusBranchExecutor
            .execute(&fx.ctx(&node))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let fx = Fixture::new().await;
        let add = Node::new(
            "add",
            NodeKind::AddToList(ListMembershipConfig {
                list_id: "news".into(),
                status: None,
            }),
        )
        .with_next("remove");
        let remove = Node::new(
            "remove",
            NodeKind::RemoveFromList(ListMembershipConfig {
                list_id: "news".into(),
                status: None,
            }),
        );

        let outcome = AddToListExecutor.execute(&fx.ctx(&add)).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Advance {
                next: Some("remove".into())
            }
        );
        assert_eq!(
            fx.storage.get_status("ws-1", "a@x.com", "news").await.unwrap(),
            Some(ListStatus::Active)
        );

        let outcome = RemoveFromListExecutor.execute(&fx.ctx(&remove)).await.unwrap();
        assert_eq!(outcome, StepOutcome::Advance { next: None });
        assert_eq!(
            fx.storage.get_status("ws-1", "a@x.com", "news").await.unwrap(),
            Some(ListStatus::Unsubscribed)
        );
    }

    #[tokio::test]
    async fn test_explicit_status_is_honoured() {
        let fx = Fixture::new().await;
        let add = Node::new(
            "add",
            NodeKind::AddToList(ListMembershipConfig {
                list_id: "news".into(),
                status: Some(ListStatus::Pending),
            }),
        );
        AddToListExecutor.execute(&fx.ctx(&add)).await.unwrap();
        assert_eq!(
            fx.storage.get_status("ws-1", "a@x.com", "news").await.unwrap(),
            Some(ListStatus::Pending)
        );
    }
}
