//! Activity-event trigger matching.
//!
//! Every inserted timeline event is offered to the live automations of its
//! workspace. Matching automations enroll the contact synchronously, with
//! `once` automations deduplicated through the trigger log.

use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use crate::automation::{Automation, Frequency, Trigger, CUSTOM_EVENT_KIND};
use crate::engine::Engine;
use crate::error::Result;
use crate::storage::{ContactAutomation, TimelineEvent};

/// Whether `trigger` fires for `event`.
///
/// Kinds match exactly. Custom events also require `custom_event_name` to
/// equal either the event's entity id or its `changes.event_name`. A
/// trigger scoped to a list or segment only fires for events on that entity.
pub fn trigger_matches(trigger: &Trigger, event: &TimelineEvent) -> bool {
    if trigger.event_kind != event.kind {
        return false;
    }

    if trigger.event_kind == CUSTOM_EVENT_KIND {
        let Some(wanted) = trigger.custom_event_name.as_deref() else {
            return false;
        };
        let by_entity = event.entity_id.as_deref() == Some(wanted);
        let by_changes = event.changes.get("event_name").and_then(|v| v.as_str()) == Some(wanted);
        if !by_entity && !by_changes {
            return false;
        }
    }

    let entity = event.entity_id.as_deref();
    [&trigger.list_id, &trigger.segment_id]
        .into_iter()
        .flatten()
        .all(|expected| entity == Some(expected.as_str()))
}

/// Routes activity events to enrollments.
#[derive(Clone)]
pub struct TriggerMatcher {
    engine: Arc<Engine>,
}

impl TriggerMatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Append `event` to the timeline, then react to it.
    pub async fn ingest(&self, event: &TimelineEvent) -> Result<Vec<ContactAutomation>> {
        self.engine.storage().save_timeline_event(event).await?;
        self.on_event(event).await
    }

    /// Enroll the event's contact in every live automation it triggers.
    ///
    /// A failure enrolling into one automation is logged and does not stop
    /// the others.
    #[instrument(skip(self, event), fields(workspace_id = %event.workspace_id, kind = %event.kind))]
    pub async fn on_event(&self, event: &TimelineEvent) -> Result<Vec<ContactAutomation>> {
        let candidates = self
            .engine
            .storage()
            .list_live_automations_for_event(&event.workspace_id, &event.kind)
            .await?;

        let mut enrolled = Vec::new();
        for automation in candidates {
            if !trigger_matches(&automation.trigger, event) {
                continue;
            }
            match self.enroll(&automation, event).await {
                Ok(Some(run)) => enrolled.push(run),
                Ok(None) => {}
                Err(e) => error!(
                    automation_id = %automation.id,
                    contact_email = %event.contact_email,
                    "Enrollment failed: {}",
                    e
                ),
            }
        }

        if !enrolled.is_empty() {
            info!(count = enrolled.len(), "Event enrolled contact");
        }
        Ok(enrolled)
    }

    async fn enroll(
        &self,
        automation: &Automation,
        event: &TimelineEvent,
    ) -> Result<Option<ContactAutomation>> {
        if automation.trigger.frequency == Frequency::Once {
            let first = self
                .engine
                .storage()
                .record_trigger(&automation.id, &event.contact_email)
                .await?;
            if !first {
                debug!(
                    automation_id = %automation.id,
                    contact_email = %event.contact_email,
                    "Already triggered once; skipping"
                );
                return Ok(None);
            }
        }

        let run = self
            .engine
            .enroll(automation, &event.contact_email, event.to_context())
            .await?;
        Ok(Some(run))
    }
}
