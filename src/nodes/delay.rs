//! Delay node - suspend the run for a fixed duration.

use async_trait::async_trait;

use super::types::{kind_mismatch, next_id, NodeContext, NodeExecutor, StepOutcome};
use crate::automation::{NodeKind, NodeType};
use crate::error::{Error, Result};

pub struct DelayExecutor;

#[async_trait]
impl NodeExecutor for DelayExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Delay
    }

    fn description(&self) -> &str {
        "Wait for a fixed duration before continuing"
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<StepOutcome> {
        let NodeKind::Delay(config) = &ctx.node.kind else {
            return Err(kind_mismatch(NodeType::Delay, ctx.node));
        };

        let duration = config.as_duration();
        let next = next_id(ctx.node.next_node_id.as_ref());
        if duration <= chrono::Duration::zero() {
            return Ok(StepOutcome::Advance { next });
        }

        // The wake-up time is fixed now, when the run reaches the node.
        let until = ctx.now.checked_add_signed(duration).ok_or_else(|| {
            Error::Configuration(format!("Delay node '{}' is out of range", ctx.node.id))
        })?;
        Ok(StepOutcome::Wait { next, until })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{DelayConfig, DelayUnit, Node};
    use crate::nodes::testing::Fixture;
    use chrono::Duration;

    fn delay(amount: u64, unit: DelayUnit) -> Node {
        Node::new(
            "wait",
            NodeKind::Delay(DelayConfig {
                duration: amount,
                unit,
            }),
        )
        .with_next("send")
    }

    #[tokio::test]
    async fn test_delay_waits_from_now() {
        let fx = Fixture::new().await;
        let node = delay(5, DelayUnit::Minutes);
        let ctx = fx.ctx(&node);
        let outcome = DelayExecutor.execute(&ctx).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Wait {
                next: Some("send".into()),
                until: ctx.now + Duration::minutes(5)
            }
        );
    }

    #[tokio::test]
    async fn test_zero_delay_passes_through() {
        let fx = Fixture::new().await;
        let node = delay(0, DelayUnit::Days);
        let outcome = DelayExecutor.execute(&fx.ctx(&node)).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Advance {
                next: Some("send".into())
            }
        );
    }

    #[tokio::test]
    async fn test_delay_units() {
        let fx = Fixture::new().await;
        for (unit, expected) in [
            (DelayUnit::Seconds, Duration::seconds(2)),
            (DelayUnit::Hours, Duration::hours(2)),
            (DelayUnit::Weeks, Duration::weeks(2)),
        ] {
            let node = delay(2, unit);
            let ctx = fx.ctx(&node);
            match DelayExecutor.execute(&ctx).await.unwrap() {
                StepOutcome::Wait { until, .. } => assert_eq!(until - ctx.now, expected),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[test]
    fn test_huge_delay_saturates() {
        let config = DelayConfig {
            duration: u64::MAX,
            unit: DelayUnit::Weeks,
        };
        assert_eq!(config.as_duration(), Duration::days(100 * 365));
    }
}
