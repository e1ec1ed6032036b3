/// The ordered list of resource intents a declaration produces
use anyhow::Result;
use serde::Serialize;

use super::resources::ResourceKind;
use crate::output::Output;

/// One desired resource, in declaration order
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIntent {
    /// Logical name, unique within the plan
    pub name: String,
    pub resource: ResourceKind,
    /// Explicit ordering dependencies
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// A named stack output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Export {
    pub name: String,
    pub value: Output<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plan {
    pub resources: Vec<ResourceIntent>,
    pub outputs: Vec<Export>,
}

impl Plan {
    pub fn resource(&self, name: &str) -> Option<&ResourceIntent> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.outputs.iter().find(|e| e.name == name)
    }

    /// Logical resource names in declaration order
    pub fn names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
