//! Automation definitions: trigger, node graph and validation.
//!
//! An automation is a per-workspace directed graph of typed nodes entered
//! through a single trigger node. Definitions are read-only while runs
//! execute against them.

mod graph;
mod parser;
mod types;
mod validator;

pub use graph::NodeGraph;
pub use parser::{parse_automation, parse_automation_file};
pub use types::*;
pub use validator::validate_automation;
