use std::collections::HashSet;

use crate::inapp::message::{Message, MessageMap};

/// Outcome of reconciling a server snapshot with the local map.
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    /// The new canonical map, in server order.
    pub messages: MessageMap,
    /// Whether the inbox-visible subset changed.
    pub inbox_changed: bool,
    /// Newly added, unread messages to report as delivered.
    pub delivered_messages: Vec<Message>,
}

/// Reconciles `server` with `current`.
///
/// The server list is authoritative for membership: ids missing from it are
/// dropped. For ids present on both sides the local copy is kept, unless the
/// server marks it read while the local copy is still unread. Duplicate ids in
/// the server list keep their first occurrence.
pub fn merge_messages(current: &MessageMap, server: Vec<Message>) -> MergeResult {
    let mut seen = HashSet::with_capacity(server.len());
    let server: Vec<Message> = server
        .into_iter()
        .filter(|message| seen.insert(message.id.clone()))
        .collect();

    let removed_inbox = current
        .values()
        .filter(|local| !seen.contains(&local.id) && local.save_to_inbox)
        .count();

    let mut added_inbox = 0usize;
    let mut overwrites = 0usize;
    let mut delivered_messages = Vec::new();
    let mut messages = MessageMap::with_capacity(server.len());

    for server_message in server {
        let merged = match current.get(&server_message.id) {
            None => {
                if server_message.save_to_inbox {
                    added_inbox += 1;
                }
                if !server_message.read {
                    delivered_messages.push(server_message.clone());
                }
                server_message
            }
            Some(local) if server_message.read && !local.read => {
                overwrites += 1;
                server_message
            }
            Some(local) => local.clone(),
        };
        messages.insert(merged.id.clone(), merged);
    }

    let inbox_changed = removed_inbox + added_inbox + overwrites > 0;

    tracing::debug!(
        target: "inapp_engine::merge::merge_messages",
        "Merged {} messages (removed inbox: {}, added inbox: {}, overwrites: {}, delivered: {})",
        messages.len(),
        removed_inbox,
        added_inbox,
        overwrites,
        delivered_messages.len()
    );

    MergeResult {
        messages,
        inbox_changed,
        delivered_messages,
    }
}
