//! Provider-facing action payloads.
//!
//! Payloads are a closed set of tagged variants, one per [`ActionType`].
//! Untyped JSON from callers is converted exactly once, in
//! [`ActionPayload::parse`], and everything downstream works with the
//! typed form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::ActionType;

/// Why a payload was rejected at the submit boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("Unknown action type: {0}")]
    UnknownType(String),
    #[error("Payload does not match the {action_type} schema: {reason}")]
    Schema { action_type: ActionType, reason: String },
    #[error("Invalid {action_type} payload: {reason}")]
    Invalid { action_type: ActionType, reason: String },
}

/// What a `delete_item` action removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Message,
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionPayload {
    LabelMessage {
        message_id: String,
        label: String,
    },
    ArchiveMessage {
        message_id: String,
    },
    AutoRespond {
        message_id: String,
        body: String,
    },
    ScheduleEvent {
        title: String,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        #[serde(default)]
        attendees: Vec<String>,
        #[serde(default)]
        location: Option<String>,
    },
    UpdateEvent {
        event_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        starts_at: Option<DateTime<Utc>>,
        #[serde(default)]
        ends_at: Option<DateTime<Utc>>,
    },
    SendMessage {
        to: Vec<String>,
        subject: String,
        body: String,
        #[serde(default)]
        thread_id: Option<String>,
    },
    DeleteItem {
        item_id: String,
        item_kind: ItemKind,
    },
}

impl ActionPayload {
    /// Parse and validate an untyped payload for the named action type.
    ///
    /// The `type` tag is taken from `action_type`; a conflicting tag inside
    /// the payload is rejected.
    pub fn parse(action_type: &str, payload: serde_json::Value) -> Result<Self, PayloadError> {
        let at: ActionType = action_type
            .parse()
            .map_err(|_| PayloadError::UnknownType(action_type.to_string()))?;

        let mut object = match payload {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(PayloadError::Schema {
                    action_type: at,
                    reason: format!("expected a JSON object, got {}", json_kind(&other)),
                })
            }
        };

        if let Some(tag) = object.get("type") {
            if tag.as_str() != Some(at.to_string().as_str()) {
                return Err(PayloadError::Schema {
                    action_type: at,
                    reason: format!("payload type tag {} does not match", tag),
                });
            }
        }
        object.insert(
            "type".to_string(),
            serde_json::Value::String(at.to_string()),
        );

        let parsed: ActionPayload = serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| PayloadError::Schema {
                action_type: at,
                reason: e.to_string(),
            })?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            ActionPayload::LabelMessage { .. } => ActionType::LabelMessage,
            ActionPayload::ArchiveMessage { .. } => ActionType::ArchiveMessage,
            ActionPayload::AutoRespond { .. } => ActionType::AutoRespond,
            ActionPayload::ScheduleEvent { .. } => ActionType::ScheduleEvent,
            ActionPayload::UpdateEvent { .. } => ActionType::UpdateEvent,
            ActionPayload::SendMessage { .. } => ActionType::SendMessage,
            ActionPayload::DeleteItem { .. } => ActionType::DeleteItem,
        }
    }

    /// Check semantic constraints serde cannot express.
    pub fn validate(&self) -> Result<(), PayloadError> {
        let at = self.action_type();
        let invalid = |reason: &str| PayloadError::Invalid {
            action_type: at,
            reason: reason.to_string(),
        };

        match self {
            ActionPayload::LabelMessage { message_id, label } => {
                require_non_empty(message_id, "message_id").map_err(|r| invalid(&r))?;
                require_non_empty(label, "label").map_err(|r| invalid(&r))?;
            }
            ActionPayload::ArchiveMessage { message_id } => {
                require_non_empty(message_id, "message_id").map_err(|r| invalid(&r))?;
            }
            ActionPayload::AutoRespond { message_id, body } => {
                require_non_empty(message_id, "message_id").map_err(|r| invalid(&r))?;
                require_non_empty(body, "body").map_err(|r| invalid(&r))?;
            }
            ActionPayload::ScheduleEvent {
                title,
                starts_at,
                ends_at,
                attendees,
                ..
            } => {
                require_non_empty(title, "title").map_err(|r| invalid(&r))?;
                if ends_at <= starts_at {
                    return Err(invalid("ends_at must be after starts_at"));
                }
                for attendee in attendees {
                    require_address(attendee).map_err(|r| invalid(&r))?;
                }
            }
            ActionPayload::UpdateEvent {
                event_id,
                title,
                starts_at,
                ends_at,
            } => {
                require_non_empty(event_id, "event_id").map_err(|r| invalid(&r))?;
                if title.is_none() && starts_at.is_none() && ends_at.is_none() {
                    return Err(invalid("at least one of title, starts_at, ends_at is required"));
                }
                if let Some(title) = title {
                    require_non_empty(title, "title").map_err(|r| invalid(&r))?;
                }
                if let (Some(start), Some(end)) = (starts_at, ends_at) {
                    if end <= start {
                        return Err(invalid("ends_at must be after starts_at"));
                    }
                }
            }
            ActionPayload::SendMessage { to, body, .. } => {
                if to.is_empty() {
                    return Err(invalid("at least one recipient is required"));
                }
                for recipient in to {
                    require_address(recipient).map_err(|r| invalid(&r))?;
                }
                require_non_empty(body, "body").map_err(|r| invalid(&r))?;
            }
            ActionPayload::DeleteItem { item_id, .. } => {
                require_non_empty(item_id, "item_id").map_err(|r| invalid(&r))?;
            }
        }
        Ok(())
    }

    /// The provider object this action touches, used to detect conflicting
    /// actions produced by the same triggering event.
    pub fn target(&self) -> Option<String> {
        match self {
            ActionPayload::LabelMessage { message_id, .. }
            | ActionPayload::ArchiveMessage { message_id }
            | ActionPayload::AutoRespond { message_id, .. } => {
                Some(format!("message:{}", message_id))
            }
            ActionPayload::UpdateEvent { event_id, .. } => Some(format!("event:{}", event_id)),
            ActionPayload::DeleteItem { item_id, item_kind } => match item_kind {
                ItemKind::Message => Some(format!("message:{}", item_id)),
                ItemKind::Event => Some(format!("event:{}", item_id)),
            },
            ActionPayload::SendMessage { thread_id, .. } => {
                thread_id.as_ref().map(|t| format!("thread:{}", t))
            }
            ActionPayload::ScheduleEvent { .. } => None,
        }
    }

    /// Short SHA-256 digest of the canonical payload.
    ///
    /// Audit records carry this instead of the payload itself.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let hash = hex::encode(Sha256::digest(&bytes));
        format!("sha256:{}", &hash[..16])
    }
}

fn require_non_empty(value: &str, field: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{} must not be empty", field))
    } else {
        Ok(())
    }
}

fn require_address(value: &str) -> Result<(), String> {
    match value.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(format!("'{}' is not a valid address", value)),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_send_message() {
        let payload = ActionPayload::parse(
            "send_message",
            json!({"to": ["bob@example.com"], "subject": "Hi", "body": "Lunch?"}),
        )
        .unwrap();
        assert_eq!(payload.action_type(), ActionType::SendMessage);
        assert_eq!(payload.target(), None);
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = ActionPayload::parse("launch_rocket", json!({})).unwrap_err();
        assert_eq!(err, PayloadError::UnknownType("launch_rocket".to_string()));
    }

    #[test]
    fn test_parse_missing_field_is_schema_error() {
        let err = ActionPayload::parse("archive_message", json!({})).unwrap_err();
        assert!(matches!(err, PayloadError::Schema { .. }));
    }

    #[test]
    fn test_parse_non_object_rejected() {
        let err = ActionPayload::parse("archive_message", json!([1, 2])).unwrap_err();
        match err {
            PayloadError::Schema { reason, .. } => assert!(reason.contains("array")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_conflicting_tag_rejected() {
        let err = ActionPayload::parse(
            "archive_message",
            json!({"type": "delete_item", "message_id": "m1"}),
        )
        .unwrap_err();
        assert!(matches!(err, PayloadError::Schema { .. }));
    }

    #[test]
    fn test_send_message_requires_valid_recipients() {
        let err = ActionPayload::parse(
            "send_message",
            json!({"to": ["not-an-address"], "subject": "", "body": "x"}),
        )
        .unwrap_err();
        assert!(matches!(err, PayloadError::Invalid { .. }));

        let err = ActionPayload::parse(
            "send_message",
            json!({"to": [], "subject": "", "body": "x"}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("recipient"));
    }

    #[test]
    fn test_schedule_event_requires_ordered_times() {
        let err = ActionPayload::parse(
            "schedule_event",
            json!({
                "title": "Standup",
                "starts_at": "2026-03-01T10:00:00Z",
                "ends_at": "2026-03-01T09:00:00Z"
            }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("ends_at"));
    }

    #[test]
    fn test_update_event_requires_a_change() {
        let err = ActionPayload::parse("update_event", json!({"event_id": "e1"})).unwrap_err();
        assert!(matches!(err, PayloadError::Invalid { .. }));

        let ok = ActionPayload::parse(
            "update_event",
            json!({"event_id": "e1", "title": "Renamed"}),
        )
        .unwrap();
        assert_eq!(ok.target().as_deref(), Some("event:e1"));
    }

    #[test]
    fn test_targets_share_namespace_across_types() {
        let archive = ActionPayload::ArchiveMessage {
            message_id: "m1".to_string(),
        };
        let reply = ActionPayload::AutoRespond {
            message_id: "m1".to_string(),
            body: "Thanks".to_string(),
        };
        let delete = ActionPayload::DeleteItem {
            item_id: "m1".to_string(),
            item_kind: ItemKind::Message,
        };
        assert_eq!(archive.target(), reply.target());
        assert_eq!(archive.target(), delete.target());
    }

    #[test]
    fn test_digest_is_stable_and_redacted() {
        let payload = ActionPayload::AutoRespond {
            message_id: "m1".to_string(),
            body: "my secret phone number is 555-1234".to_string(),
        };
        let d1 = payload.digest();
        let d2 = payload.clone().digest();
        assert_eq!(d1, d2);
        assert!(d1.starts_with("sha256:"));
        assert_eq!(d1.len(), "sha256:".len() + 16);
        assert!(!d1.contains("555"));
    }

    #[test]
    fn test_serialized_form_carries_type_tag() {
        let payload = ActionPayload::ArchiveMessage {
            message_id: "m9".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "archive_message");
        let back: ActionPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }
}
