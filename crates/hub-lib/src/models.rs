//! Runtime data models shared with the HTTP layer

use crate::settings::ContainerResources;
use serde::{Deserialize, Serialize};

/// A live browser worker created by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserInstance {
    /// Short container id (local) or pod name (cluster)
    pub id: String,
    #[serde(rename = "type")]
    pub browser_type: String,
    pub resources: ContainerResources,
}

impl BrowserInstance {
    pub fn new(
        id: impl Into<String>,
        browser_type: impl Into<String>,
        resources: ContainerResources,
    ) -> Self {
        Self {
            id: id.into(),
            browser_type: browser_type.into(),
            resources,
        }
    }
}

/// Point-in-time status of one worker as reported by its backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserStatus {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl BrowserStatus {
    pub const NOT_FOUND: &'static str = "not found";

    pub fn not_found(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: Self::NOT_FOUND.to_string(),
            name: None,
            image: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.status != Self::NOT_FOUND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_instance_serializes_type_field() {
        let instance = BrowserInstance::new("abc123", "chrome", ContainerResources::default());
        let json = serde_json::to_value(&instance).unwrap();
        assert_eq!(json["type"], "chrome");
        assert_eq!(json["resources"]["memory"], "1G");
    }

    #[test]
    fn test_not_found_status() {
        let status = BrowserStatus::not_found("gone");
        assert!(!status.exists());
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("image").is_none());
    }
}
