//! Node executors.
//!
//! Each node type has one executor. Executors are stateless; everything they
//! need arrives through [`NodeContext`], and they report what the walk
//! should do next as a [`StepOutcome`].

mod branch;
mod delay;
mod email;
mod filter;
mod lists;
mod registry;
mod trigger;
mod types;

pub use ab_test::AbTestExecutor;
pub use branch::BranchExecutor;
pub use delay::DelayExecutor;
pub use email::EmailExecutor;
pub use filter::FilterExecutor;
pub use lists::{AddToListExecutor, ListStatusBranchExecutor, RemoveFromListExecutor};
pub use registry::ExecutorRegistry;
pub use trigger::TriggerExecutor;
pub use types::{NodeContext, NodeExecutor, Services, StepOutcome};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::{json, Value};

    use super::{NodeContext, Services};
    use crate::automation::{parse_automation, Automation, Node};
    use crate::conditions::ConditionEvaluator;
    use crate::services::testing::RecordingSender;
    use crate::storage::{ContactAutomation, SqliteStorage};

    const YAML: &str = r#"
name: fixture
trigger:
  event_kind: list.subscribed
root_node_id: start
nodes:
  - id: start
    type: trigger
"#;

    /// One automation, one run and in-memory collaborators for executor tests.
    pub struct Fixture {
        pub storage: SqliteStorage,
        pub sender: Arc<RecordingSender>,
        pub services: Services,
        pub automation: Automation,
        pub run: ContactAutomation,
    }

    impl Fixture {
        pub async fn new() -> Self {
            Self::with_context(json!({"email": "a@x.com", "changes": {}})).await
        }

        pub async fn with_context(context: Value) -> Self {
            let storage = SqliteStorage::open_in_memory().unwrap();
            storage.create_list("ws-1", "news", "Newsletter").await.unwrap();
            let sender = Arc::new(RecordingSender::default());
            let services = Services {
                sender: sender.clone(),
                lists: Arc::new(storage.clone()),
                evaluator: ConditionEvaluator::default(),
                send_timeout: Duration::from_secs(5),
            };
            let automation = Automation::from_definition("ws-1", parse_automation(YAML).unwrap());
            let run = ContactAutomation::new(&automation.id, "ws-1", "a@x.com", "start", context, 3);
            Self {
                storage,
                sender,
                services,
                automation,
                run,
            }
        }

        pub fn ctx<'a>(&'a self, node: &'a Node) -> NodeContext<'a> {
            NodeContext {
                automation: &self.automation,
                run: &self.run,
                node,
                now: Utc::now(),
                services: &self.services,
            }
        }
    }
}
