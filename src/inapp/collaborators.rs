//! Traits for the host-supplied collaborators the engine talks to.
//!
//! The engine never renders, never talks to the network and never interprets
//! deep links itself; all of that goes through these seams.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::inapp::error::CollaboratorError;
use crate::inapp::message::Message;

/// Callback invoked with the clicked URL of a message shown through
/// [`InAppManager::show`](crate::inapp::InAppManager::show).
pub type UrlCallback = Box<dyn FnOnce(&str) + Send>;

/// Supplies the raw fetch payload (`{"inAppMessages": [...]}`).
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> Result<Value, CollaboratorError>;
}

/// How a displayed message left the screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayOutcome {
    Clicked(String),
    Dismissed,
}

pub enum ShowResult {
    /// The message is on screen. The receiver resolves when the user clicks
    /// or dismisses it; there is no timeout.
    Shown(oneshot::Receiver<DisplayOutcome>),
    /// The displayer declined, e.g. because another message is on screen.
    NotShown(String),
}

impl std::fmt::Debug for ShowResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShowResult::Shown(_) => write!(f, "Shown"),
            ShowResult::NotShown(reason) => write!(f, "NotShown({reason})"),
        }
    }
}

/// Renders messages. Only ever called from the UI lane.
#[async_trait]
pub trait Displayer: Send + Sync {
    fn is_showing(&self) -> bool;

    async fn show(&self, message: &Message) -> ShowResult;
}

/// Where a message was acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InAppLocation {
    InApp,
    Inbox,
}

/// What caused a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InAppDeleteSource {
    InboxSwipe,
    DeleteButton,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeContext {
    pub location: InAppLocation,
    pub source: Option<InAppDeleteSource>,
    pub inbox_session_id: Option<String>,
    pub save_to_inbox: bool,
}

/// Counts captured at the start and end of an inbox session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub start_total_message_count: usize,
    pub start_unread_message_count: usize,
    pub end_total_message_count: usize,
    pub end_unread_message_count: usize,
}

/// Tracking calls back to the server. Failures are logged by the engine and
/// never retried.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn track_delivery(&self, message: &Message) -> Result<(), CollaboratorError>;

    async fn track_consume(
        &self,
        message_id: &str,
        context: &ConsumeContext,
    ) -> Result<(), CollaboratorError>;

    async fn track_read_state(&self, message_id: &str, read: bool) -> Result<(), CollaboratorError>;

    async fn track_inbox_session(&self, session: &InboxSession) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InAppResponse {
    Show,
    Skip,
}

/// Host decision for every automatically selected message.
pub trait InAppDelegate: Send + Sync {
    fn on_new_message(&self, message: &Message) -> InAppResponse;
}

/// Whether the host application is in a state where messages may be shown.
pub trait ApplicationStateProvider: Send + Sync {
    fn is_active(&self) -> bool;
}

/// Handles clicked URLs the engine does not act on itself.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// `action:` and `itbl://` URLs, with the scheme stripped.
    async fn handle_custom_action(&self, action: &str, message: &Message);

    async fn open_url(&self, url: &str, message: &Message);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shows every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDelegate;

impl InAppDelegate for DefaultDelegate {
    fn on_new_message(&self, _message: &Message) -> InAppResponse {
        InAppResponse::Show
    }
}

/// Always active.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysActive;

impl ApplicationStateProvider for AlwaysActive {
    fn is_active(&self) -> bool {
        true
    }
}

/// Logs and drops every action.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopActionHandler;

#[async_trait]
impl ActionHandler for NoopActionHandler {
    async fn handle_custom_action(&self, action: &str, message: &Message) {
        tracing::debug!(
            target: "inapp_engine::collaborators::handle_custom_action",
            "No action handler for {} (message {})",
            action,
            message.id
        );
    }

    async fn open_url(&self, url: &str, message: &Message) {
        tracing::debug!(
            target: "inapp_engine::collaborators::open_url",
            "No action handler to open {} (message {})",
            url,
            message.id
        );
    }
}

/// Everything the engine needs from the host. The fetcher, displayer and
/// reporter are required; the rest have defaults.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub displayer: Arc<dyn Displayer>,
    pub reporter: Arc<dyn Reporter>,
    pub delegate: Arc<dyn InAppDelegate>,
    pub app_state: Arc<dyn ApplicationStateProvider>,
    pub action_handler: Arc<dyn ActionHandler>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        displayer: Arc<dyn Displayer>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            fetcher,
            displayer,
            reporter,
            delegate: Arc::new(DefaultDelegate),
            app_state: Arc::new(AlwaysActive),
            action_handler: Arc::new(NoopActionHandler),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn InAppDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    pub fn with_app_state(mut self, app_state: Arc<dyn ApplicationStateProvider>) -> Self {
        self.app_state = app_state;
        self
    }

    pub fn with_action_handler(mut self, action_handler: Arc<dyn ActionHandler>) -> Self {
        self.action_handler = action_handler;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
