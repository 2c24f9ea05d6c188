//! Normalization of raw fetch payloads into typed [`Message`] values.
//!
//! This is the only place that deals with loosely typed JSON. Everything past
//! this boundary works with [`Message`].

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::inapp::error::ParseError;
use crate::inapp::message::{priority, InboxMetadata, Message, MessageContent, Trigger};

pub const MESSAGES_KEY: &str = "inAppMessages";

mod keys {
    pub const MESSAGE_ID: &str = "messageId";
    pub const CAMPAIGN_ID: &str = "campaignId";
    pub const CONTENT: &str = "content";
    pub const CONTENT_TYPE: &str = "contentType";
    pub const TYPE: &str = "type";
    pub const TRIGGER: &str = "trigger";
    pub const SAVE_TO_INBOX: &str = "saveToInbox";
    pub const INBOX_METADATA: &str = "inboxMetadata";
    pub const CUSTOM_PAYLOAD: &str = "customPayload";
    pub const CREATED_AT: &str = "createdAt";
    pub const EXPIRES_AT: &str = "expiresAt";
    pub const PRIORITY_LEVEL: &str = "priorityLevel";
    pub const JSON_ONLY: &str = "jsonOnly";
    pub const READ: &str = "read";
    pub const TITLE: &str = "title";
    pub const SUBTITLE: &str = "subtitle";
    pub const ICON: &str = "icon";
}

/// Legacy keys that may arrive inside `customPayload` instead of top level.
const PROMOTED_KEYS: [&str; 3] = [keys::SAVE_TO_INBOX, keys::TRIGGER, keys::INBOX_METADATA];

/// Parses every entry of the `inAppMessages` array.
///
/// Entries are parsed independently; one bad entry never hides the others.
/// A payload without the array yields no entries.
pub fn parse_payload(payload: &Value) -> Vec<Result<Message, ParseError>> {
    match payload.get(MESSAGES_KEY).and_then(Value::as_array) {
        Some(entries) => entries.iter().map(parse_message).collect(),
        None => {
            tracing::debug!(
                target: "inapp_engine::parser::parse_payload",
                "Payload has no {} array",
                MESSAGES_KEY
            );
            Vec::new()
        }
    }
}

/// Parses a single payload entry.
pub fn parse_message(entry: &Value) -> Result<Message, ParseError> {
    let Some(object) = entry.as_object() else {
        return Err(ParseError::new("entry is not a json object", None));
    };

    let Some(id) = object.get(keys::MESSAGE_ID).and_then(Value::as_str) else {
        return Err(ParseError::new("no messageId", None));
    };

    let mut object = object.clone();
    promote_legacy_fields(&mut object);

    let json_only = is_truthy(object.get(keys::JSON_ONLY));

    let content = match object.get(keys::CONTENT).and_then(Value::as_object) {
        Some(content) => MessageContent::from_raw(content.clone()),
        None if json_only => MessageContent::placeholder(),
        None => {
            return Err(ParseError::new(
                "no content in json payload",
                Some(id.to_string()),
            ));
        }
    };

    let custom_payload = match object.get(keys::CUSTOM_PAYLOAD).and_then(Value::as_object) {
        Some(custom_payload) => Some(custom_payload.clone()),
        None if json_only => Some(Map::new()),
        None => None,
    };

    let trigger = object
        .get(keys::TRIGGER)
        .and_then(Value::as_object)
        .map(|raw| Trigger::from_raw(raw.clone()))
        .unwrap_or_else(Trigger::immediate);

    let save_to_inbox = !json_only
        && object
            .get(keys::SAVE_TO_INBOX)
            .and_then(Value::as_bool)
            .unwrap_or(false);

    let mut message = Message::new(id, content);
    message.campaign_id = object.get(keys::CAMPAIGN_ID).and_then(Value::as_i64);
    message.trigger = trigger;
    message.created_at = parse_millis(object.get(keys::CREATED_AT));
    message.expires_at = parse_millis(object.get(keys::EXPIRES_AT));
    message.save_to_inbox = save_to_inbox;
    message.inbox_metadata = object
        .get(keys::INBOX_METADATA)
        .and_then(Value::as_object)
        .map(parse_inbox_metadata);
    message.custom_payload = custom_payload;
    message.priority_level = object
        .get(keys::PRIORITY_LEVEL)
        .and_then(Value::as_f64)
        .unwrap_or(priority::UNASSIGNED);
    message.json_only = json_only;
    message.read = object
        .get(keys::READ)
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(message)
}

/// Moves legacy keys from `customPayload` to where they belong. An existing
/// destination value is never overwritten, and a key that was not moved stays
/// in `customPayload`.
fn promote_legacy_fields(object: &mut Map<String, Value>) {
    let Some(Value::Object(mut custom_payload)) = object.remove(keys::CUSTOM_PAYLOAD) else {
        return;
    };

    for key in PROMOTED_KEYS {
        if object.contains_key(key) {
            continue;
        }
        if let Some(value) = custom_payload.remove(key) {
            object.insert(key.to_string(), value);
        }
    }

    if let Some(Value::Object(content)) = object.get_mut(keys::CONTENT) {
        if !content.contains_key(keys::TYPE) {
            if let Some(content_type) = custom_payload.remove(keys::CONTENT_TYPE) {
                content.insert(keys::TYPE.to_string(), content_type);
            }
        }
    }

    object.insert(keys::CUSTOM_PAYLOAD.to_string(), Value::Object(custom_payload));
}

/// `true`, or any non-zero number.
fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

fn parse_millis(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let millis = match value? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|n| n as i64))?,
        _ => return None,
    };
    DateTime::from_timestamp_millis(millis)
}

fn parse_inbox_metadata(raw: &Map<String, Value>) -> InboxMetadata {
    let field = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);
    InboxMetadata {
        title: field(keys::TITLE),
        subtitle: field(keys::SUBTITLE),
        icon: field(keys::ICON),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inapp::message::{ContentType, TriggerType};
    use serde_json::json;

    #[test]
    fn test_parse_full_entry() {
        let entry = json!({
            "messageId": "m1",
            "campaignId": 42,
            "content": {"type": "banner", "html": "<p>hi</p>"},
            "trigger": {"type": "event", "details": "purchase"},
            "saveToInbox": true,
            "inboxMetadata": {"title": "Hello", "subtitle": "World", "icon": "https://x/icon.png"},
            "customPayload": {"promo": "abc"},
            "createdAt": 1_700_000_000_000i64,
            "expiresAt": 1_800_000_000_000i64,
            "priorityLevel": 100.0,
            "read": true
        });

        let message = parse_message(&entry).unwrap();
        assert_eq!(message.id, "m1");
        assert_eq!(message.campaign_id, Some(42));
        assert_eq!(message.content.content_type, ContentType::Banner);
        assert_eq!(message.trigger.trigger_type, TriggerType::Event);
        assert!(message.save_to_inbox);
        assert_eq!(
            message.inbox_metadata.as_ref().and_then(|m| m.title.clone()),
            Some("Hello".to_string())
        );
        assert_eq!(message.custom_payload.unwrap()["promo"], "abc");
        assert_eq!(
            message.created_at.unwrap().timestamp_millis(),
            1_700_000_000_000
        );
        assert_eq!(
            message.expires_at.unwrap().timestamp_millis(),
            1_800_000_000_000
        );
        assert_eq!(message.priority_level, priority::CRITICAL);
        assert!(message.read);
        assert!(!message.did_process_trigger);
        assert!(!message.consumed);
    }

    #[test]
    fn test_missing_id_is_rejected_without_id() {
        let err = parse_message(&json!({"content": {}})).unwrap_err();
        assert_eq!(err.reason, "no messageId");
        assert_eq!(err.message_id, None);

        let err = parse_message(&json!({"messageId": 7, "content": {}})).unwrap_err();
        assert_eq!(err.reason, "no messageId");
    }

    #[test]
    fn test_missing_content_carries_id() {
        let err = parse_message(&json!({"messageId": "m1"})).unwrap_err();
        assert_eq!(err.reason, "no content in json payload");
        assert_eq!(err.message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_defaults() {
        let message = parse_message(&json!({"messageId": "m1", "content": {}})).unwrap();
        assert_eq!(message.trigger.trigger_type, TriggerType::Immediate);
        assert_eq!(message.content.content_type, ContentType::Html);
        assert_eq!(message.priority_level, priority::UNASSIGNED);
        assert!(!message.save_to_inbox);
        assert!(!message.json_only);
        assert!(message.custom_payload.is_none());
        assert!(message.expires_at.is_none());
    }

    #[test]
    fn test_json_only_forces_inbox_off_and_defaults_payload() {
        let message = parse_message(&json!({
            "messageId": "m1",
            "jsonOnly": 1,
            "saveToInbox": true
        }))
        .unwrap();
        assert!(message.json_only);
        assert!(!message.save_to_inbox);
        assert_eq!(message.custom_payload, Some(Map::new()));
        assert_eq!(message.content, MessageContent::placeholder());

        let message =
            parse_message(&json!({"messageId": "m2", "jsonOnly": 0, "content": {}})).unwrap();
        assert!(!message.json_only);
    }

    #[test]
    fn test_legacy_fields_are_promoted() {
        let message = parse_message(&json!({
            "messageId": "m1",
            "content": {"html": "<p/>"},
            "customPayload": {
                "saveToInbox": true,
                "trigger": {"type": "never"},
                "inboxMetadata": {"title": "Legacy"},
                "contentType": "alert",
                "keep": 1
            }
        }))
        .unwrap();

        assert!(message.save_to_inbox);
        assert_eq!(message.trigger.trigger_type, TriggerType::Never);
        assert_eq!(
            message.inbox_metadata.unwrap().title.as_deref(),
            Some("Legacy")
        );
        assert_eq!(message.content.content_type, ContentType::Alert);

        let custom_payload = message.custom_payload.unwrap();
        assert_eq!(custom_payload.len(), 1);
        assert_eq!(custom_payload["keep"], 1);
    }

    #[test]
    fn test_top_level_wins_over_legacy_fields() {
        let message = parse_message(&json!({
            "messageId": "m1",
            "content": {"type": "banner"},
            "saveToInbox": false,
            "trigger": {"type": "immediate"},
            "customPayload": {
                "saveToInbox": true,
                "trigger": {"type": "never"},
                "contentType": "alert"
            }
        }))
        .unwrap();

        assert!(!message.save_to_inbox);
        assert_eq!(message.trigger.trigger_type, TriggerType::Immediate);
        assert_eq!(message.content.content_type, ContentType::Banner);

        // Keys that lost to the top level stay where they were.
        let custom_payload = message.custom_payload.unwrap();
        assert_eq!(custom_payload["saveToInbox"], true);
        assert_eq!(custom_payload["contentType"], "alert");
    }

    #[test]
    fn test_unknown_trigger_is_undefined() {
        let message = parse_message(&json!({
            "messageId": "m1",
            "content": {},
            "trigger": {"type": "geofence"}
        }))
        .unwrap();
        assert_eq!(message.trigger.trigger_type, TriggerType::Undefined);
    }

    #[test]
    fn test_wrongly_typed_optional_fields_are_ignored() {
        let message = parse_message(&json!({
            "messageId": "m1",
            "content": {},
            "campaignId": "abc",
            "priorityLevel": "high",
            "expiresAt": "tomorrow",
            "read": "yes",
            "saveToInbox": "true"
        }))
        .unwrap();
        assert_eq!(message.campaign_id, None);
        assert_eq!(message.priority_level, priority::UNASSIGNED);
        assert_eq!(message.expires_at, None);
        assert!(!message.read);
        assert!(!message.save_to_inbox);
    }

    #[test]
    fn test_parse_payload_collects_per_entry_results() {
        let payload = json!({
            "inAppMessages": [
                {"messageId": "a", "content": {}},
                {"messageId": "b"},
                {"content": {}},
                "garbage",
                {"messageId": "c", "content": {}}
            ]
        });

        let results = parse_payload(&payload);
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].as_ref().unwrap().id, "a");
        assert_eq!(
            results[1].as_ref().unwrap_err().message_id.as_deref(),
            Some("b")
        );
        assert!(results[2].is_err());
        assert!(results[3].is_err());
        assert_eq!(results[4].as_ref().unwrap().id, "c");
    }

    #[test]
    fn test_parse_payload_without_array() {
        assert!(parse_payload(&json!({})).is_empty());
        assert!(parse_payload(&json!({"inAppMessages": {}})).is_empty());
    }
}
