//! Automation document parser.

use std::path::Path;

use super::types::AutomationDefinition;
use crate::error::{Error, Result};

/// Parse an automation definition from a YAML (or JSON) string.
pub fn parse_automation(yaml: &str) -> Result<AutomationDefinition> {
    if yaml.trim().is_empty() {
        return Err(Error::Parse("Empty automation definition".to_string()));
    }

    serde_yaml::from_str(yaml).map_err(|e| {
        let msg = e.to_string();
        if let Some(field) = extract_missing_field(&msg) {
            Error::Parse(format!("Missing required field: {}", field))
        } else {
            Error::Parse(format!("Invalid automation document: {}", msg))
        }
    })
}

/// Parse an automation definition from a file path.
pub fn parse_automation_file(path: &Path) -> Result<AutomationDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_automation(&content)
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}
