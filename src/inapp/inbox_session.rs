use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::inapp::collaborators::InboxSession;

#[derive(Debug, Clone)]
struct ActiveSession {
    id: String,
    started_at: DateTime<Utc>,
    total_message_count: usize,
    unread_message_count: usize,
}

/// Tracks the inbox session the user currently has open, if any.
#[derive(Debug, Default)]
pub struct InboxSessionTracker {
    active: Option<ActiveSession>,
}

impl InboxSessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_id(&self) -> Option<String> {
        self.active.as_ref().map(|session| session.id.clone())
    }

    /// Starts a new session, replacing one that was never ended.
    pub fn start(&mut self, now: DateTime<Utc>, total: usize, unread: usize) -> String {
        if let Some(previous) = &self.active {
            tracing::warn!(
                target: "inapp_engine::inbox_session::start",
                "Inbox session {} was never ended, replacing it",
                previous.id
            );
        }
        let id = Uuid::new_v4().to_string();
        self.active = Some(ActiveSession {
            id: id.clone(),
            started_at: now,
            total_message_count: total,
            unread_message_count: unread,
        });
        id
    }

    /// Ends the active session. `None` when no session was started.
    pub fn end(&mut self, now: DateTime<Utc>, total: usize, unread: usize) -> Option<InboxSession> {
        let active = self.active.take()?;
        Some(InboxSession {
            id: active.id,
            started_at: active.started_at,
            ended_at: now,
            start_total_message_count: active.total_message_count,
            start_unread_message_count: active.unread_message_count,
            end_total_message_count: total,
            end_unread_message_count: unread,
        })
    }
}
