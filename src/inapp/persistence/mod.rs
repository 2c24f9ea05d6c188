//! Durable storage of the canonical message map.
//!
//! Every backend stores the same versioned record produced by
//! [`encode_message`]. Decoding is lenient: missing or wrongly typed fields get
//! their defaults, and a record without an id is dropped. Loading from
//! missing or corrupt storage yields an empty list.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::inapp::error::PersistenceError;
use crate::inapp::message::{priority, InboxMetadata, Message, MessageContent, Trigger};

pub mod database;
pub mod file;

pub use database::SqlitePersister;
pub use file::FilePersister;

pub const SCHEMA_VERSION: i64 = 1;

#[async_trait]
pub trait Persister: Send + Sync {
    /// Never fails: unreadable storage is logged and treated as empty.
    async fn load(&self) -> Vec<Message>;

    /// Replaces the stored set with `messages`, preserving their order.
    async fn save(&self, messages: &[Message]) -> Result<(), PersistenceError>;

    async fn clear(&self) -> Result<(), PersistenceError>;
}

/// Volatile storage for tests and hosts that do not persist messages.
#[derive(Debug, Default)]
pub struct InMemoryPersister {
    messages: Mutex<Vec<Message>>,
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(messages),
        }
    }

    /// The currently stored messages.
    pub fn stored(&self) -> Vec<Message> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Persister for InMemoryPersister {
    async fn load(&self) -> Vec<Message> {
        self.stored()
    }

    async fn save(&self, messages: &[Message]) -> Result<(), PersistenceError> {
        if let Ok(mut stored) = self.messages.lock() {
            *stored = messages.to_vec();
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), PersistenceError> {
        if let Ok(mut stored) = self.messages.lock() {
            stored.clear();
        }
        Ok(())
    }
}

mod fields {
    pub const ID: &str = "id";
    pub const CAMPAIGN_ID: &str = "campaignId";
    pub const TRIGGER: &str = "trigger";
    pub const CREATED_AT: &str = "createdAt";
    pub const EXPIRES_AT: &str = "expiresAt";
    pub const CONTENT: &str = "content";
    pub const SAVE_TO_INBOX: &str = "saveToInbox";
    pub const INBOX_METADATA: &str = "inboxMetadata";
    pub const CUSTOM_PAYLOAD: &str = "customPayload";
    pub const PRIORITY_LEVEL: &str = "priorityLevel";
    pub const JSON_ONLY: &str = "jsonOnly";
    pub const READ: &str = "read";
    pub const DID_PROCESS_TRIGGER: &str = "didProcessTrigger";
    pub const CONSUMED: &str = "consumed";
    pub const VERSION: &str = "version";
    pub const MESSAGES: &str = "messages";
}

/// Encodes one message as a schema-version-1 record. Timestamps are stored as
/// epoch milliseconds.
pub fn encode_message(message: &Message) -> Value {
    let mut record = Map::new();
    record.insert(fields::ID.into(), json!(message.id));
    if let Some(campaign_id) = message.campaign_id {
        record.insert(fields::CAMPAIGN_ID.into(), json!(campaign_id));
    }
    record.insert(fields::TRIGGER.into(), Value::Object(message.trigger.raw.clone()));
    if let Some(created_at) = message.created_at {
        record.insert(fields::CREATED_AT.into(), json!(created_at.timestamp_millis()));
    }
    if let Some(expires_at) = message.expires_at {
        record.insert(fields::EXPIRES_AT.into(), json!(expires_at.timestamp_millis()));
    }
    record.insert(fields::CONTENT.into(), Value::Object(message.content.raw.clone()));
    record.insert(fields::SAVE_TO_INBOX.into(), json!(message.save_to_inbox));
    if let Some(metadata) = &message.inbox_metadata {
        record.insert(
            fields::INBOX_METADATA.into(),
            json!({
                "title": metadata.title,
                "subtitle": metadata.subtitle,
                "icon": metadata.icon,
            }),
        );
    }
    if let Some(custom_payload) = &message.custom_payload {
        record.insert(fields::CUSTOM_PAYLOAD.into(), Value::Object(custom_payload.clone()));
    }
    record.insert(fields::PRIORITY_LEVEL.into(), json!(message.priority_level));
    record.insert(fields::JSON_ONLY.into(), json!(message.json_only));
    record.insert(fields::READ.into(), json!(message.read));
    record.insert(fields::DID_PROCESS_TRIGGER.into(), json!(message.did_process_trigger));
    record.insert(fields::CONSUMED.into(), json!(message.consumed));
    Value::Object(record)
}

/// Decodes a record written by [`encode_message`]. `None` when the record has
/// no usable id.
pub fn decode_message(record: &Value) -> Option<Message> {
    let record = record.as_object()?;
    let id = record.get(fields::ID)?.as_str()?;

    let object_field = |key: &str| record.get(key).and_then(Value::as_object).cloned();
    let bool_field = |key: &str| record.get(key).and_then(Value::as_bool).unwrap_or(false);
    let millis_field = |key: &str| {
        record
            .get(key)
            .and_then(Value::as_i64)
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    };

    let content = object_field(fields::CONTENT)
        .map(MessageContent::from_raw)
        .unwrap_or_else(MessageContent::placeholder);

    let mut message = Message::new(id, content);
    message.campaign_id = record.get(fields::CAMPAIGN_ID).and_then(Value::as_i64);
    message.trigger = object_field(fields::TRIGGER)
        .map(Trigger::from_raw)
        .unwrap_or_else(Trigger::immediate);
    message.created_at = millis_field(fields::CREATED_AT);
    message.expires_at = millis_field(fields::EXPIRES_AT);
    message.save_to_inbox = bool_field(fields::SAVE_TO_INBOX);
    message.inbox_metadata = object_field(fields::INBOX_METADATA).map(|raw| {
        let text = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);
        InboxMetadata {
            title: text("title"),
            subtitle: text("subtitle"),
            icon: text("icon"),
        }
    });
    message.custom_payload = object_field(fields::CUSTOM_PAYLOAD);
    message.priority_level = record
        .get(fields::PRIORITY_LEVEL)
        .and_then(Value::as_f64)
        .unwrap_or(priority::UNASSIGNED);
    message.json_only = bool_field(fields::JSON_ONLY);
    if message.json_only {
        message.save_to_inbox = false;
    }
    message.read = bool_field(fields::READ);
    message.did_process_trigger = bool_field(fields::DID_PROCESS_TRIGGER);
    message.consumed = bool_field(fields::CONSUMED);
    Some(message)
}

/// Wraps encoded messages in the versioned document used by file storage.
pub fn encode_document(messages: &[Message]) -> Value {
    let records: Vec<Value> = messages.iter().map(encode_message).collect();
    let mut document = Map::new();
    document.insert(fields::VERSION.into(), json!(SCHEMA_VERSION));
    document.insert(fields::MESSAGES.into(), Value::Array(records));
    Value::Object(document)
}

/// Decodes a document from [`encode_document`], dropping unreadable records.
pub fn decode_document(document: &Value) -> Vec<Message> {
    let version = document
        .get(fields::VERSION)
        .and_then(Value::as_i64)
        .unwrap_or(SCHEMA_VERSION);
    if version > SCHEMA_VERSION {
        tracing::warn!(
            target: "inapp_engine::persistence::decode_document",
            "Stored schema version {} is newer than {}, decoding known fields only",
            version,
            SCHEMA_VERSION
        );
    }

    let Some(records) = document.get(fields::MESSAGES).and_then(Value::as_array) else {
        tracing::warn!(
            target: "inapp_engine::persistence::decode_document",
            "Stored document has no messages array"
        );
        return Vec::new();
    };

    decode_records(records.iter())
}

pub(crate) fn decode_records<'a>(records: impl Iterator<Item = &'a Value>) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();
    for record in records {
        match decode_message(record) {
            Some(message) if messages.iter().any(|m| m.id == message.id) => {
                tracing::warn!(
                    target: "inapp_engine::persistence::decode_records",
                    "Dropping duplicate stored message {}",
                    message.id
                );
            }
            Some(message) => messages.push(message),
            None => {
                tracing::warn!(
                    target: "inapp_engine::persistence::decode_records",
                    "Dropping stored record without an id"
                );
            }
        }
    }
    messages
}
