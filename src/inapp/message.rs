use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value};

/// The canonical, insertion-ordered set of messages keyed by message id.
pub type MessageMap = IndexMap<String, Message>;

/// Named priority levels. Lower values are shown first.
pub mod priority {
    pub const CRITICAL: f64 = 100.0;
    pub const HIGH: f64 = 200.0;
    pub const MEDIUM: f64 = 300.0;
    pub const LOW: f64 = 400.0;

    /// Used when the server did not assign a priority.
    pub const UNASSIGNED: f64 = 300.5;
}

/// Controls whether the engine selects a message for display on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerType {
    /// Shown automatically as soon as the display gate allows it.
    Immediate,
    /// Shown only when the host asks for it in response to an event.
    Event,
    /// Never shown automatically; inbox only.
    Never,
    /// A type string this engine does not know. Treated like `Never`.
    Undefined,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerType::Immediate => write!(f, "immediate"),
            TriggerType::Event => write!(f, "event"),
            TriggerType::Never => write!(f, "never"),
            TriggerType::Undefined => write!(f, "undefined"),
        }
    }
}

impl FromStr for TriggerType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "immediate" => TriggerType::Immediate,
            "event" => TriggerType::Event,
            "never" => TriggerType::Never,
            _ => TriggerType::Undefined,
        })
    }
}

/// A message trigger: the parsed type plus every attribute the server sent,
/// so that event-driven hosts can inspect extra fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub trigger_type: TriggerType,
    pub raw: Map<String, Value>,
}

impl Trigger {
    pub fn from_raw(raw: Map<String, Value>) -> Self {
        let trigger_type = raw
            .get("type")
            .and_then(Value::as_str)
            .map(|s| s.parse().unwrap_or(TriggerType::Undefined))
            .unwrap_or(TriggerType::Undefined);
        Self { trigger_type, raw }
    }

    pub fn of_type(trigger_type: TriggerType) -> Self {
        let mut raw = Map::new();
        raw.insert("type".to_string(), Value::String(trigger_type.to_string()));
        Self { trigger_type, raw }
    }

    /// Trigger used when the payload carries none.
    pub fn immediate() -> Self {
        Self::of_type(TriggerType::Immediate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Html,
    Alert,
    Banner,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::Html => write!(f, "html"),
            ContentType::Alert => write!(f, "alert"),
            ContentType::Banner => write!(f, "banner"),
        }
    }
}

impl ContentType {
    /// Unknown strings fall back to html.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "alert" => ContentType::Alert,
            "banner" => ContentType::Banner,
            _ => ContentType::Html,
        }
    }
}

/// Renderable content, owned by the rendering collaborator. The engine only
/// cares whether it is present.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContent {
    pub content_type: ContentType,
    pub raw: Map<String, Value>,
}

impl MessageContent {
    pub fn from_raw(raw: Map<String, Value>) -> Self {
        let content_type = raw
            .get("type")
            .and_then(Value::as_str)
            .map(ContentType::from_str_lossy)
            .unwrap_or(ContentType::Html);
        Self { content_type, raw }
    }

    /// Empty content carried by json-only messages.
    pub fn placeholder() -> Self {
        Self {
            content_type: ContentType::Html,
            raw: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboxMetadata {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub icon: Option<String>,
}

/// An in-app message as held in the canonical map.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Server-assigned id, primary key of the map
    pub id: String,
    pub campaign_id: Option<i64>,
    pub trigger: Trigger,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub content: MessageContent,
    /// Keep the message in the inbox after it has been shown
    pub save_to_inbox: bool,
    pub inbox_metadata: Option<InboxMetadata>,
    /// Passed through to the host untouched
    pub custom_payload: Option<Map<String, Value>>,
    pub priority_level: f64,
    /// Carries only `custom_payload`; never rendered
    pub json_only: bool,
    pub read: bool,
    pub did_process_trigger: bool,
    pub consumed: bool,
}

impl Message {
    /// Creates an unprocessed message with default attributes.
    pub fn new(id: impl Into<String>, content: MessageContent) -> Self {
        Self {
            id: id.into(),
            campaign_id: None,
            trigger: Trigger::immediate(),
            created_at: None,
            expires_at: None,
            content,
            save_to_inbox: false,
            inbox_metadata: None,
            custom_payload: None,
            priority_level: priority::UNASSIGNED,
            json_only: false,
            read: false,
            did_process_trigger: false,
            consumed: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Whether the message belongs in query results at `now`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && !self.is_expired(now)
    }

    /// Consumed messages that are not kept in the inbox.
    pub fn is_garbage(&self) -> bool {
        self.consumed && !self.save_to_inbox
    }

    /// Eligible for automatic selection by the trigger processor.
    pub fn is_processable_trigger(&self) -> bool {
        !self.did_process_trigger && self.trigger.trigger_type == TriggerType::Immediate && !self.read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn trigger_type_parsing_is_case_insensitive_and_lossy() {
        assert_eq!("Immediate".parse::<TriggerType>().unwrap(), TriggerType::Immediate);
        assert_eq!("EVENT".parse::<TriggerType>().unwrap(), TriggerType::Event);
        assert_eq!("never".parse::<TriggerType>().unwrap(), TriggerType::Never);
        assert_eq!("on-launch".parse::<TriggerType>().unwrap(), TriggerType::Undefined);
    }

    #[test]
    fn trigger_from_raw_keeps_extra_attributes() {
        let raw = serde_json::json!({"type": "event", "details": {"name": "purchase"}});
        let trigger = Trigger::from_raw(raw.as_object().unwrap().clone());
        assert_eq!(trigger.trigger_type, TriggerType::Event);
        assert_eq!(trigger.raw["details"]["name"], "purchase");
    }

    #[test]
    fn trigger_without_type_is_undefined() {
        let trigger = Trigger::from_raw(Map::new());
        assert_eq!(trigger.trigger_type, TriggerType::Undefined);
    }

    #[test]
    fn content_type_falls_back_to_html() {
        assert_eq!(ContentType::from_str_lossy("Banner"), ContentType::Banner);
        assert_eq!(ContentType::from_str_lossy("video"), ContentType::Html);
    }

    #[test]
    fn expiration_is_inclusive() {
        let now = Utc::now();
        let mut message = Message::new("m1", MessageContent::placeholder());
        assert!(!message.is_expired(now));

        message.expires_at = Some(now);
        assert!(message.is_expired(now));
        assert!(!message.is_valid(now));

        message.expires_at = Some(now + TimeDelta::seconds(10));
        assert!(message.is_valid(now));
    }

    #[test]
    fn garbage_requires_consumed_and_not_inbox() {
        let mut message = Message::new("m1", MessageContent::placeholder());
        message.consumed = true;
        assert!(message.is_garbage());

        message.save_to_inbox = true;
        assert!(!message.is_garbage());
    }

    #[test]
    fn processable_trigger_rules() {
        let mut message = Message::new("m1", MessageContent::placeholder());
        assert!(message.is_processable_trigger());

        message.trigger = Trigger::of_type(TriggerType::Never);
        assert!(!message.is_processable_trigger());

        message.trigger = Trigger::immediate();
        message.read = true;
        assert!(!message.is_processable_trigger());

        message.read = false;
        message.did_process_trigger = true;
        assert!(!message.is_processable_trigger());
    }
}
