//! Automation type definitions.
//!
//! Nodes are authored with a string `type` and a free-form `config` map, the
//! same shape the YAML documents use. They are decoded exactly once into
//! [`NodeKind`] when the definition is loaded, so executors never look at
//! untyped configuration.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::graph::NodeGraph;
use crate::conditions::Condition;
use crate::error::{Error, Result};

/// Event kind used by custom application events.
pub const CUSTOM_EVENT_KIND: &str = "custom_event";

/// Automation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    Draft,
    Live,
    Paused,
}

impl fmt::Display for AutomationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Live => write!(f, "live"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl FromStr for AutomationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "live" => Ok(Self::Live),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("Unknown automation status: {}", s)),
        }
    }
}

/// Enrollment policy for repeated trigger events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    /// A contact is enrolled at most once, ever.
    #[default]
    Once,
    /// Every matching event enrolls the contact again.
    EveryTime,
}

/// What starts an automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Activity event kind to react to (e.g. `list.subscribed`)
    pub event_kind: String,

    /// Restrict list triggers to one list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_id: Option<String>,

    /// Restrict segment triggers to one segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,

    /// Name of the custom event when `event_kind` is `custom_event`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_event_name: Option<String>,

    #[serde(default)]
    pub frequency: Frequency,
}

/// Per-automation counters, exposed read-only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationStats {
    pub enrolled: u64,
    pub completed: u64,
    pub exited: u64,
    pub failed: u64,
}

/// Authoring document for an automation.
///
/// # Example YAML
///
/// ```yaml
/// name: welcome-series
/// trigger:
///   event_kind: list.subscribed
///   list_id: newsletter
///   frequency: once
/// root_node_id: start
/// nodes:
///   - id: start
///     type: trigger
///     next_node_id: welcome
///   - id: welcome
///     type: email
///     config:
///       template_id: tpl-welcome
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationDefinition {
    pub name: String,
    pub trigger: Trigger,
    pub root_node_id: String,
    pub nodes: NodeGraph,
}

/// A stored automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub status: AutomationStatus,
    pub trigger: Trigger,
    pub root_node_id: String,
    pub nodes: NodeGraph,
    pub stats: AutomationStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Automation {
    /// Build a new draft automation from an authoring document.
    pub fn from_definition(workspace_id: &str, definition: AutomationDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            name: definition.name,
            status: AutomationStatus::Draft,
            trigger: definition.trigger,
            root_node_id: definition.root_node_id,
            nodes: definition.nodes,
            stats: AutomationStats::default(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// The authoring document this automation was built from.
    pub fn definition(&self) -> AutomationDefinition {
        AutomationDefinition {
            name: self.name.clone(),
            trigger: self.trigger.clone(),
            root_node_id: self.root_node_id.clone(),
            nodes: self.nodes.clone(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Live and not soft-deleted.
    pub fn is_schedulable(&self) -> bool {
        self.status == AutomationStatus::Live && !self.is_deleted()
    }
}

/// Node type discriminant, also the executor registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    Email,
    Delay,
    Branch,
    Filter,
    AbTest,
    ListStatusBranch,
    AddToList,
    RemoveFromList,
}

impl NodeType {
    pub const ALL: [NodeType; 9] = [
        NodeType::Trigger,
        NodeType::Email,
        NodeType::Delay,
        NodeType::Branch,
        NodeType::Filter,
        NodeType::AbTest,
        NodeType::ListStatusBranch,
        NodeType::AddToList,
        NodeType::RemoveFromList,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Trigger => "trigger",
            NodeType::Email => "email",
            NodeType::Delay => "delay",
            NodeType::Branch => "branch",
            NodeType::Filter => "filter",
            NodeType::AbTest => "ab_test",
            NodeType::ListStatusBranch => "list_status_branch",
            NodeType::AddToList => "add_to_list",
            NodeType::RemoveFromList => "remove_from_list",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        NodeType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown node type: {}", s))
    }
}

/// Time unit of a delay node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

/// Longest delay a node can express (about 100 years).
const MAX_DELAY_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

impl DelayUnit {
    fn seconds(&self) -> u64 {
        match self {
            DelayUnit::Seconds => 1,
            DelayUnit::Minutes => 60,
            DelayUnit::Hours => 60 * 60,
            DelayUnit::Days => 24 * 60 * 60,
            DelayUnit::Weeks => 7 * 24 * 60 * 60,
        }
    }

    /// Convert an amount of this unit into a duration, saturating at about
    /// 100 years.
    pub fn duration(&self, amount: u64) -> Duration {
        let secs = amount.saturating_mul(self.seconds()).min(MAX_DELAY_SECONDS);
        Duration::seconds(secs as i64)
    }
}

/// Contact list membership status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListStatus {
    Active,
    Pending,
    Unsubscribed,
    Bounced,
    Complained,
}

impl fmt::Display for ListStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListStatus::Active => write!(f, "active"),
            ListStatus::Pending => write!(f, "pending"),
            ListStatus::Unsubscribed => write!(f, "unsubscribed"),
            ListStatus::Bounced => write!(f, "bounced"),
            ListStatus::Complained => write!(f, "complained"),
        }
    }
}

impl FromStr for ListStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ListStatus::Active),
            "pending" => Ok(ListStatus::Pending),
            "unsubscribed" => Ok(ListStatus::Unsubscribed),
            "bounced" => Ok(ListStatus::Bounced),
            "complained" => Ok(ListStatus::Complained),
            _ => Err(format!("Unknown list status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    pub template_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    pub duration: u64,
    pub unit: DelayUnit,
}

impl DelayConfig {
    pub fn as_duration(&self) -> Duration {
        self.unit.duration(self.duration)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchPath {
    pub conditions: Condition,
    #[serde(default)]
    pub next_node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub paths: Vec<BranchPath>,
    /// Successor used when no path matches
    #[serde(default)]
    pub default_path_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub conditions: Condition,
    #[serde(default)]
    pub continue_node_id: Option<String>,
    #[serde(default)]
    pub exit_node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub weight: u32,
    #[serde(default)]
    pub next_node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbTestConfig {
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListStatusBranchConfig {
    pub list_id: String,
    #[serde(default)]
    pub active_node_id: Option<String>,
    #[serde(default)]
    pub non_active_node_id: Option<String>,
    #[serde(default)]
    pub not_in_list_node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListMembershipConfig {
    pub list_id: String,
    #[serde(default)]
    pub status: Option<ListStatus>,
}

/// Decoded, type-specific node configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Trigger,
    Email(EmailConfig),
    Delay(DelayConfig),
    Branch(BranchConfig),
    Filter(FilterConfig),
    AbTest(AbTestConfig),
    ListStatusBranch(ListStatusBranchConfig),
    AddToList(ListMembershipConfig),
    RemoveFromList(ListMembershipConfig),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Trigger => NodeType::Trigger,
            NodeKind::Email(_) => NodeType::Email,
            NodeKind::Delay(_) => NodeType::Delay,
            NodeKind::Branch(_) => NodeType::Branch,
            NodeKind::Filter(_) => NodeType::Filter,
            NodeKind::AbTest(_) => NodeType::AbTest,
            NodeKind::ListStatusBranch(_) => NodeType::ListStatusBranch,
            NodeKind::AddToList(_) => NodeType::AddToList,
            NodeKind::RemoveFromList(_) => NodeType::RemoveFromList,
        }
    }

    fn decode(node_type: NodeType, config: Value) -> std::result::Result<Self, serde_json::Error> {
        // A missing config decodes like an empty map so that serde reports
        // the missing field by name.
        let config = if config.is_null() {
            Value::Object(Default::default())
        } else {
            config
        };
        Ok(match node_type {
            NodeType::Trigger => NodeKind::Trigger,
            NodeType::Email => NodeKind::Email(serde_json::from_value(config)?),
            NodeType::Delay => NodeKind::Delay(serde_json::from_value(config)?),
            NodeType::Branch => NodeKind::Branch(serde_json::from_value(config)?),
            NodeType::Filter => NodeKind::Filter(serde_json::from_value(config)?),
            NodeType::AbTest => NodeKind::AbTest(serde_json::from_value(config)?),
            NodeType::ListStatusBranch => {
                NodeKind::ListStatusBranch(serde_json::from_value(config)?)
            }
            NodeType::AddToList => NodeKind::AddToList(serde_json::from_value(config)?),
            NodeType::RemoveFromList => NodeKind::RemoveFromList(serde_json::from_value(config)?),
        })
    }

    fn encode(&self) -> Value {
        let encoded = match self {
            NodeKind::Trigger => return Value::Null,
            NodeKind::Email(c) => serde_json::to_value(c),
            NodeKind::Delay(c) => serde_json::to_value(c),
            NodeKind::Branch(c) => serde_json::to_value(c),
            NodeKind::Filter(c) => serde_json::to_value(c),
            NodeKind::AbTest(c) => serde_json::to_value(c),
            NodeKind::ListStatusBranch(c) => serde_json::to_value(c),
            NodeKind::AddToList(c) | NodeKind::RemoveFromList(c) => serde_json::to_value(c),
        };
        encoded.unwrap_or(Value::Null)
    }
}

/// A typed workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    /// Linear successor; `None` means the run completes after this node.
    pub next_node_id: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            next_node_id: None,
        }
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next_node_id = Some(next.into());
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    /// Every node id this node can hand control to.
    pub fn successors(&self) -> Vec<&str> {
        let mut out: Vec<Option<&String>> = vec![self.next_node_id.as_ref()];
        match &self.kind {
            NodeKind::Branch(c) => {
                out.extend(c.paths.iter().map(|p| p.next_node_id.as_ref()));
                out.push(c.default_path_id.as_ref());
            }
            NodeKind::Filter(c) => {
                out.push(c.continue_node_id.as_ref());
                out.push(c.exit_node_id.as_ref());
            }
            NodeKind::AbTest(c) => {
                out.extend(c.variants.iter().map(|v| v.next_node_id.as_ref()));
            }
            NodeKind::ListStatusBranch(c) => {
                out.push(c.active_node_id.as_ref());
                out.push(c.non_active_node_id.as_ref());
                out.push(c.not_in_list_node_id.as_ref());
            }
            _ => {}
        }
        out.into_iter()
            .flatten()
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Wire shape of a node: string type plus untyped config.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next_node_id: Option<String>,
}

impl TryFrom<RawNode> for Node {
    type Error = Error;

    fn try_from(raw: RawNode) -> Result<Self> {
        let node_type: NodeType = raw
            .node_type
            .parse()
            .map_err(|e: String| Error::Validation(format!("Node '{}': {}", raw.id, e)))?;
        let kind = NodeKind::decode(node_type, raw.config).map_err(|e| {
            Error::Validation(format!(
                "Invalid {} config for node '{}': {}",
                node_type, raw.id, e
            ))
        })?;
        Ok(Node {
            id: raw.id,
            kind,
            next_node_id: raw.next_node_id.filter(|s| !s.is_empty()),
        })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        RawNode {
            config: node.kind.encode(),
            node_type: node.node_type().as_str().to_string(),
            id: node.id,
            next_node_id: node.next_node_id,
        }
    }
}
