//! Action templates: fill `{field}` placeholders from the triggering event.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use deputy_core::payload::{ActionPayload, PayloadError};
use deputy_core::policy::{ActionTemplate, TriggerEvent};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_][a-z0-9_]*)\}").expect("valid placeholder regex"));

/// Build a validated payload from `template` for `event`.
///
/// Besides the event's fields, `{account_id}` and `{event_type}` are
/// always available. Referencing a field the event does not carry is an
/// error rather than an empty substitution.
pub fn materialize(
    template: &ActionTemplate,
    event: &TriggerEvent,
) -> Result<ActionPayload, PayloadError> {
    let payload = fill(&template.payload, event).map_err(|field| PayloadError::Schema {
        action_type: template.action_type,
        reason: format!("template references missing field {{{}}}", field),
    })?;
    ActionPayload::parse(&template.action_type.to_string(), payload)
}

fn fill(value: &Value, event: &TriggerEvent) -> Result<Value, String> {
    match value {
        Value::String(s) => fill_str(s, event).map(Value::String),
        Value::Array(items) => items
            .iter()
            .map(|v| fill(v, event))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), fill(v, event)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn fill_str(s: &str, event: &TriggerEvent) -> Result<String, String> {
    let mut missing = None;
    let filled = PLACEHOLDER.replace_all(s, |caps: &Captures| {
        let name = &caps[1];
        match lookup(name, event) {
            Some(v) => v,
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(field) => Err(field),
        None => Ok(filled.into_owned()),
    }
}

fn lookup(name: &str, event: &TriggerEvent) -> Option<String> {
    match name {
        "account_id" => Some(event.account_id.clone()),
        "event_type" => Some(event.event_type.to_string()),
        _ => event.fields.get(name).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deputy_core::policy::TriggerKind;
    use deputy_core::types::ActionType;
    use serde_json::json;

    fn message_event() -> TriggerEvent {
        TriggerEvent::new(TriggerKind::NewMessage, "acct")
            .with_field("message_id", "m-42")
            .with_field("from", "ann@example.com")
    }

    #[test]
    fn test_fills_placeholders() {
        let template = ActionTemplate {
            action_type: ActionType::LabelMessage,
            payload: json!({"message_id": "{message_id}", "label": "from-{account_id}"}),
        };
        let payload = materialize(&template, &message_event()).unwrap();
        assert_eq!(
            payload,
            ActionPayload::LabelMessage {
                message_id: "m-42".to_string(),
                label: "from-acct".to_string(),
            }
        );
    }

    #[test]
    fn test_fills_nested_arrays() {
        let template = ActionTemplate {
            action_type: ActionType::SendMessage,
            payload: json!({
                "to": ["{from}"],
                "subject": "Re: {event_type}",
                "body": "Got it"
            }),
        };
        match materialize(&template, &message_event()).unwrap() {
            ActionPayload::SendMessage { to, subject, .. } => {
                assert_eq!(to, vec!["ann@example.com".to_string()]);
                assert_eq!(subject, "Re: new_message");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_missing_field_is_error() {
        let template = ActionTemplate {
            action_type: ActionType::ArchiveMessage,
            payload: json!({"message_id": "{thread_id}"}),
        };
        let err = materialize(&template, &message_event()).unwrap_err();
        assert!(err.to_string().contains("{thread_id}"));
    }

    #[test]
    fn test_result_is_validated() {
        let template = ActionTemplate {
            action_type: ActionType::ArchiveMessage,
            payload: json!({"message_id": "{empty}"}),
        };
        let event = message_event().with_field("empty", "");
        assert!(materialize(&template, &event).is_err());
    }

    #[test]
    fn test_literal_braces_untouched() {
        let template = ActionTemplate {
            action_type: ActionType::AutoRespond,
            payload: json!({"message_id": "{message_id}", "body": "Use {Curly} braces {}"}),
        };
        match materialize(&template, &message_event()).unwrap() {
            ActionPayload::AutoRespond { body, .. } => assert_eq!(body, "Use {Curly} braces {}"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
