//! Email node - hand a templated message to the sender.

use async_trait::async_trait;
use tracing::debug;

use super::types::{kind_mismatch, NodeContext, NodeExecutor, StepOutcome};
use crate::automation::{NodeKind, NodeType};
use crate::error::{Error, Result};
use crate::services::OutboundMessage;

pub struct EmailExecutor;

#[async_trait]
impl NodeExecutor for EmailExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Email
    }

    fn description(&self) -> &str {
        "Send a templated email to the contact"
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<StepOutcome> {
        let NodeKind::Email(config) = &ctx.node.kind else {
            return Err(kind_mismatch(NodeType::Email, ctx.node));
        };

        let message = OutboundMessage {
            workspace_id: ctx.run.workspace_id.clone(),
            contact_email: ctx.run.contact_email.clone(),
            template_id: config.template_id.clone(),
            automation_id: ctx.automation.id.clone(),
            run_id: ctx.run.id.clone(),
            node_id: ctx.node.id.clone(),
            context: ctx.run.context.clone(),
        };

        let timeout = ctx.services.send_timeout;
        let message_id = tokio::time::timeout(timeout, ctx.services.sender.send(&message))
            .await
            .map_err(|_| {
                Error::Execution(format!("Send timed out after {}s", timeout.as_secs_f64()))
            })??;

        debug!(
            run_id = %ctx.run.id,
            template_id = %config.template_id,
            message_id = %message_id,
            "Email sent"
        );

        Ok(StepOutcome::advance(ctx.node.next_node_id.as_ref()))
    }
}
