//! Automation validation.

use std::collections::HashSet;

use super::types::{AutomationDefinition, NodeKind, CUSTOM_EVENT_KIND};
use crate::error::{Error, Result};

/// Validate an automation definition.
///
/// Checks for:
/// - Required fields (name, trigger event kind, nodes)
/// - Coherent trigger (custom events name the event)
/// - Root node exists and is the only trigger node
/// - Per-type config sanity (positive delays and weights, non-empty ids)
/// - Every successor reference exists (`Error::Graph`)
/// - No cycles (`Error::Graph`)
pub fn validate_automation(definition: &AutomationDefinition) -> Result<()> {
    if definition.name.trim().is_empty() {
        return Err(Error::Validation("Automation name is required".into()));
    }

    let trigger = &definition.trigger;
    if trigger.event_kind.trim().is_empty() {
        return Err(Error::Validation("Trigger event_kind is required".into()));
    }
    if trigger.event_kind == CUSTOM_EVENT_KIND
        && trigger
            .custom_event_name
            .as_deref()
            .map_or(true, |name| name.trim().is_empty())
    {
        return Err(Error::Validation(
            "Custom event triggers require custom_event_name".into(),
        ));
    }

    if definition.nodes.is_empty() {
        return Err(Error::Validation(
            "Automation must have at least one node".into(),
        ));
    }

    let root = definition.nodes.get(&definition.root_node_id).ok_or_else(|| {
        Error::Graph(format!(
            "Root node '{}' does not exist",
            definition.root_node_id
        ))
    })?;
    if root.kind != NodeKind::Trigger {
        return Err(Error::Validation(format!(
            "Root node '{}' must be a trigger node, found {}",
            root.id,
            root.node_type()
        )));
    }

    for node in definition.nodes.iter() {
        if node.kind == NodeKind::Trigger && node.id != root.id {
            return Err(Error::Validation(format!(
                "Node '{}' is a second trigger node; only the root may be a trigger",
                node.id
            )));
        }
        validate_node_config(&node.id, &node.kind)?;
    }

    if let Some((from, to)) = definition.nodes.dangling_reference() {
        return Err(Error::Graph(format!(
            "Node '{}' references non-existent node '{}'",
            from, to
        )));
    }

    if let Some(node_id) = definition.nodes.find_cycle() {
        return Err(Error::Graph(format!(
            "Automation graph has a cycle through node '{}'",
            node_id
        )));
    }

    Ok(())
}

fn validate_node_config(node_id: &str, kind: &NodeKind) -> Result<()> {
    match kind {
        NodeKind::Trigger => {}
        NodeKind::Email(config) => {
            if config.template_id.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "Email node '{}' requires a template_id",
                    node_id
                )));
            }
        }
        NodeKind::Delay(config) => {
            if config.duration == 0 {
                return Err(Error::Validation(format!(
                    "Delay node '{}' must have a positive duration",
                    node_id
                )));
            }
        }
        NodeKind::Branch(config) => {
            if config.paths.is_empty() {
                return Err(Error::Validation(format!(
                    "Branch node '{}' requires at least one path",
                    node_id
                )));
            }
        }
        NodeKind::Filter(_) => {}
        NodeKind::AbTest(config) => {
            if config.variants.is_empty() {
                return Err(Error::Validation(format!(
                    "A/B test node '{}' requires at least one variant",
                    node_id
                )));
            }
            let mut ids = HashSet::new();
            for variant in &config.variants {
                if variant.weight == 0 {
                    return Err(Error::Validation(format!(
                        "A/B test node '{}' variant '{}' must have a positive weight",
                        node_id, variant.id
                    )));
                }
                if !ids.insert(variant.id.as_str()) {
                    return Err(Error::Validation(format!(
                        "A/B test node '{}' has duplicate variant '{}'",
                        node_id, variant.id
                    )));
                }
            }
        }
        NodeKind::ListStatusBranch(config) => {
            require_list_id(node_id, &config.list_id)?;
        }
        NodeKind::AddToList(config) | NodeKind::RemoveFromList(config) => {
            require_list_id(node_id, &config.list_id)?;
        }
    }
    Ok(())
}

fn require_list_id(node_id: &str, list_id: &str) -> Result<()> {
    if list_id.trim().is_empty() {
        return Err(Error::Validation(format!(
            "Node '{}' requires a list_id",
            node_id
        )));
    }
    Ok(())
}
