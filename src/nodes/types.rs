//! Executor trait and context types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::automation::{Automation, Node, NodeType};
use crate::conditions::ConditionEvaluator;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::services::{ContactLists, HttpMessageSender, LogSender, MessageSender};
use crate::storage::{ContactAutomation, ExitReason};

/// Collaborators shared by every executor.
#[derive(Clone)]
pub struct Services {
    pub sender: Arc<dyn MessageSender>,
    pub lists: Arc<dyn ContactLists>,
    pub evaluator: ConditionEvaluator,
    /// Upper bound on a single send call
    pub send_timeout: Duration,
}

impl Services {
    /// Wire collaborators from configuration. Sends go to the HTTP endpoint
    /// when one is configured and are only logged otherwise.
    pub fn from_config(config: &Config, lists: Arc<dyn ContactLists>) -> Self {
        let send_timeout = Duration::from_secs(config.sender.timeout_seconds.max(1));
        let sender: Arc<dyn MessageSender> = match &config.sender.endpoint {
            Some(endpoint) => Arc::new(HttpMessageSender::new(endpoint.as_str(), send_timeout)),
            None => Arc::new(LogSender),
        };
        Self {
            sender,
            lists,
            evaluator: ConditionEvaluator::new(config.conditions.comparison),
            send_timeout,
        }
    }
}

/// Everything an executor may look at for one step.
pub struct NodeContext<'a> {
    pub automation: &'a Automation,
    pub run: &'a ContactAutomation,
    pub node: &'a Node,
    /// Clock reading taken when the step started
    pub now: DateTime<Utc>,
    pub services: &'a Services,
}

/// What the walk should do after a node executes.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Continue with `next` right away. `None` completes the run.
    Advance { next: Option<String> },
    /// Suspend until `until`, then continue with `next`.
    Wait {
        next: Option<String>,
        until: DateTime<Utc>,
    },
    /// End the run at this node.
    Exit { reason: ExitReason },
}

impl StepOutcome {
    pub fn advance(next: Option<&String>) -> Self {
        StepOutcome::Advance {
            next: next_id(next),
        }
    }
}

/// Normalise a successor reference; empty ids mean completion.
pub(crate) fn next_id(id: Option<&String>) -> Option<String> {
    id.filter(|s| !s.is_empty()).cloned()
}

/// One implementation per node type.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Node type this executor handles.
    fn node_type(&self) -> NodeType;

    fn description(&self) -> &str;

    /// Execute one node for one run.
    ///
    /// Errors are classified by the walk: transient ones are retried with
    /// backoff, everything else fails the run.
    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<StepOutcome>;
}

pub(crate) fn kind_mismatch(expected: NodeType, node: &Node) -> Error {
    Error::Internal(format!(
        "{} executor received node '{}' of type {}",
        expected,
        node.id,
        node.node_type()
    ))
}
