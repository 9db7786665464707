use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Part, PermissionRequest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartUpdated {
    pub part: Part,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdle {
    #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

/// The event types the shell reacts to. Anything else is `Unknown` and ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    PermissionAsked(PermissionRequest),
    MessagePartUpdated(PartUpdated),
    SessionIdle(SessionIdle),
    SessionCreated(SessionChange),
    SessionUpdated(SessionChange),
    SessionDeleted(SessionChange),
    Unknown(String),
}

impl ServerEvent {
    /// Classifies one decoded `{type, properties}` record.
    ///
    /// A recognized type whose properties do not match the expected shape is an
    /// error; an unrecognized type is never an error.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let Value::Object(mut object) = value else {
            return Ok(Self::Unknown(String::new()));
        };
        let event_type = match object.remove("type") {
            Some(Value::String(event_type)) => event_type,
            _ => return Ok(Self::Unknown(String::new())),
        };
        let properties = match object.remove("properties") {
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(properties) => properties,
        };

        let event = match event_type.as_str() {
            "permission.asked" => Self::PermissionAsked(serde_json::from_value(properties)?),
            "message.part.updated" => Self::MessagePartUpdated(serde_json::from_value(properties)?),
            "session.idle" => Self::SessionIdle(serde_json::from_value(properties)?),
            "session.created" => Self::SessionCreated(serde_json::from_value(properties)?),
            "session.updated" => Self::SessionUpdated(serde_json::from_value(properties)?),
            "session.deleted" => Self::SessionDeleted(serde_json::from_value(properties)?),
            _ => Self::Unknown(event_type),
        };
        Ok(event)
    }

    pub fn type_name(&self) -> &str {
        match self {
            Self::PermissionAsked(_) => "permission.asked",
            Self::MessagePartUpdated(_) => "message.part.updated",
            Self::SessionIdle(_) => "session.idle",
            Self::SessionCreated(_) => "session.created",
            Self::SessionUpdated(_) => "session.updated",
            Self::SessionDeleted(_) => "session.deleted",
            Self::Unknown(event_type) => event_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn permission_asked_carries_request() {
        let event = ServerEvent::from_value(json!({
            "type": "permission.asked",
            "properties": {
                "id": "r1", "sessionID": "s1", "permission": "bash",
                "patterns": ["git status"], "always": ["git *"]
            }
        }))
        .expect("event");
        let ServerEvent::PermissionAsked(request) = event else {
            panic!("expected permission.asked");
        };
        assert_eq!(request.id, "r1");
        assert_eq!(request.always, vec!["git *".to_string()]);
    }

    #[test]
    fn part_update_delta_is_optional() {
        let event = ServerEvent::from_value(json!({
            "type": "message.part.updated",
            "properties": {"part": {"id": "p1", "messageID": "m1", "sessionID": "s1", "type": "text"}}
        }))
        .expect("event");
        let ServerEvent::MessagePartUpdated(update) = event else {
            panic!("expected message.part.updated");
        };
        assert_eq!(update.delta, None);
        assert_eq!(update.part.text(), Some(""));
    }

    #[test]
    fn idle_without_properties_is_accepted() {
        let event = ServerEvent::from_value(json!({"type": "session.idle"})).expect("event");
        assert_eq!(event, ServerEvent::SessionIdle(SessionIdle::default()));
        assert_eq!(event.type_name(), "session.idle");
    }

    #[test]
    fn unknown_types_are_not_errors() {
        let event = ServerEvent::from_value(json!({
            "type": "lsp.client.diagnostics",
            "properties": {"anything": [1, 2, 3]}
        }))
        .expect("event");
        assert_eq!(event, ServerEvent::Unknown("lsp.client.diagnostics".to_string()));
        assert_eq!(event.type_name(), "lsp.client.diagnostics");
        assert_eq!(
            ServerEvent::from_value(json!([1, 2])).expect("event"),
            ServerEvent::Unknown(String::new())
        );
    }

    #[test]
    fn malformed_known_event_is_an_error() {
        let result = ServerEvent::from_value(json!({
            "type": "permission.asked",
            "properties": {"id": 7}
        }));
        assert!(result.is_err());
    }
}
