//! Wire shapes for the `/v1/subscribe` WebSocket protocol.

use serde::{Deserialize, Serialize};

/// Client-to-server subscribe message: `{ "resourceType": "...", "revision": "..." }`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(default)]
    pub revision: Option<String>,
}

/// The four event names the wire protocol carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventName {
    #[serde(rename = "resource.create")]
    ResourceCreate,
    #[serde(rename = "resource.change")]
    ResourceChange,
    #[serde(rename = "resource.remove")]
    ResourceRemove,
    #[serde(rename = "resource.stop")]
    ResourceStop,
}

/// Server-to-client message: `{ "name": ..., "resourceType": ..., "object": {...} }`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    pub name: EventName,
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    pub object: serde_json::Value,
}

impl ServerMessage {
    pub fn stop(resource_type: &str, reason: &str) -> Self {
        Self {
            name: EventName::ResourceStop,
            resource_type: resource_type.to_string(),
            object: serde_json::json!({ "reason": reason }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_serialize_to_dotted_wire_form() {
        let msg = ServerMessage { name: EventName::ResourceChange, resource_type: "pods".into(), object: serde_json::json!({}) };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["name"], "resource.change");
    }

    #[test]
    fn client_message_accepts_missing_revision() {
        let msg: ClientMessage = serde_json::from_str(r#"{"resourceType":"pods"}"#).unwrap();
        assert!(msg.revision.is_none());
    }
}
