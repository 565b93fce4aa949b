//! Filter node - let matching contacts through, route or exit the rest.

use async_trait::async_trait;

use super::types::{kind_mismatch, NodeContext, NodeExecutor, StepOutcome};
use crate::automation::{NodeKind, NodeType};
use crate::error::Result;
use crate::storage::ExitReason;

pub struct FilterExecutor;

#[async_trait]
impl NodeExecutor for FilterExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Filter
    }

    fn description(&self) -> &str {
        "Continue when conditions match; otherwise take the exit path or leave"
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<StepOutcome> {
        let NodeKind::Filter(config) = &ctx.node.kind else {
            return Err(kind_mismatch(NodeType::Filter, ctx.node));
        };

        if ctx
            .services
            .evaluator
            .evaluate(&config.conditions, &ctx.run.context)
        {
            return Ok(StepOutcome::advance(config.continue_node_id.as_ref()));
        }

        match config.exit_node_id.as_deref() {
            Some(exit) if !exit.is_empty() => Ok(StepOutcome::Advance {
                next: Some(exit.to_string()),
            }),
            _ => Ok(StepOutcome::Exit {
                reason: ExitReason::FilteredOut,
            }),
        }
    }
}
