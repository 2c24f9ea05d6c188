use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, oneshot, watch};

pub mod actions;
pub mod collaborators;
pub mod error;
pub mod inbox_session;
mod lanes;
pub mod merge;
pub mod message;
pub mod notifications;
pub mod parser;
pub mod persistence;
pub mod processor;
pub mod scheduler;

use crate::init_tracing;

use collaborators::{Collaborators, InAppDeleteSource, InAppLocation, InboxSession, UrlCallback};
use error::{InAppError, Result};
use inbox_session::InboxSessionTracker;
use lanes::{
    report_read_state, LaneContext, Lanes, MessageChange, MutationCommand, ShowOrigin, SyncRequest,
    UiCommand,
};
use message::{Message, MessageMap};
use notifications::{InboxChanged, InboxNotifier};
use persistence::{Persister, SqlitePersister};
use scheduler::SchedulerPhase;

/// Minimum gap between two automatic displays, and between a dismissal and
/// the next automatic display.
pub const DEFAULT_DISPLAY_INTERVAL: Duration = Duration::from_secs(30);

/// Minimum gap between two syncs triggered by the app entering the foreground.
pub const DEFAULT_FOREGROUND_SYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct InAppConfig {
    /// Directory for the message store
    pub data_dir: PathBuf,

    /// Directory for application logs
    pub logs_dir: PathBuf,

    pub display_interval: Duration,

    pub move_to_foreground_sync_interval: Duration,

    /// Schemes besides `https` that clicked URLs may be opened with
    pub allowed_protocols: Vec<String>,
}

impl InAppConfig {
    pub fn new(data_dir: &Path, logs_dir: &Path) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            data_dir: data_dir.join(env_suffix),
            logs_dir: logs_dir.join(env_suffix),
            display_interval: DEFAULT_DISPLAY_INTERVAL,
            move_to_foreground_sync_interval: DEFAULT_FOREGROUND_SYNC_INTERVAL,
            allowed_protocols: Vec::new(),
        }
    }

    pub fn with_display_interval(mut self, display_interval: Duration) -> Self {
        self.display_interval = display_interval;
        self
    }

    pub fn with_foreground_sync_interval(mut self, interval: Duration) -> Self {
        self.move_to_foreground_sync_interval = interval;
        self
    }

    pub fn with_allowed_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }
}

/// Entry point for the host application.
///
/// Queries read the latest published snapshot and never wait on the engine.
/// Everything that changes state is handed to the engine's lanes and applied
/// in submission order.
pub struct InAppManager {
    pub config: InAppConfig,
    collaborators: Collaborators,
    lanes: Lanes,
    snapshot: watch::Receiver<Arc<MessageMap>>,
    phase: watch::Receiver<SchedulerPhase>,
    notifier: InboxNotifier,
    paused: Arc<AtomicBool>,
    inbox_sessions: tokio::sync::Mutex<InboxSessionTracker>,
}

impl std::fmt::Debug for InAppManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InAppManager")
            .field("config", &self.config)
            .field("message_count", &self.snapshot.borrow().len())
            .field("phase", &*self.phase.borrow())
            .field("paused", &self.is_auto_display_paused())
            .finish_non_exhaustive()
    }
}

impl InAppManager {
    /// Sets up the data and log directories, configures logging, opens the
    /// SQLite message store in the data directory and starts the engine.
    ///
    /// # Arguments
    ///
    /// * `config` - An [`InAppConfig`] specifying directories and intervals.
    /// * `collaborators` - The host-supplied fetcher, displayer, reporter and friends.
    pub async fn initialize(config: InAppConfig, collaborators: Collaborators) -> Result<Self> {
        let data_dir = &config.data_dir;
        let logs_dir = &config.logs_dir;

        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))
            .map_err(InAppError::from)?;
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))
            .map_err(InAppError::from)?;

        init_tracing(logs_dir);

        tracing::debug!(
            target: "inapp_engine::initialize",
            "Logging initialized in directory: {:?}",
            logs_dir
        );

        let persister = SqlitePersister::in_dir(data_dir).await?;
        Ok(Self::new(config, collaborators, Arc::new(persister)).await)
    }

    /// Starts the engine on top of an already constructed store. Must be
    /// called from within a tokio runtime.
    pub async fn new(
        config: InAppConfig,
        collaborators: Collaborators,
        persister: Arc<dyn Persister>,
    ) -> Self {
        let mut initial = MessageMap::new();
        for message in persister.load().await {
            if !initial.contains_key(&message.id) {
                initial.insert(message.id.clone(), message);
            }
        }
        tracing::info!(
            target: "inapp_engine::new",
            "Restored {} messages from the store",
            initial.len()
        );

        let notifier = InboxNotifier::new();
        let paused = Arc::new(AtomicBool::new(false));
        let context = LaneContext {
            config: config.clone(),
            collaborators: collaborators.clone(),
            notifier: notifier.clone(),
        };
        let (lanes, views) = Lanes::spawn(context, persister, paused.clone(), initial);

        Self {
            config,
            collaborators,
            lanes,
            snapshot: views.snapshot,
            phase: views.phase,
            notifier,
            paused,
            inbox_sessions: tokio::sync::Mutex::new(InboxSessionTracker::new()),
        }
    }

    // ============================================================================
    // QUERIES
    // ============================================================================

    /// Messages that are neither consumed nor expired, in server order.
    pub fn get_messages(&self) -> Vec<Message> {
        let now = self.collaborators.clock.now();
        self.snapshot
            .borrow()
            .values()
            .filter(|message| message.is_valid(now))
            .cloned()
            .collect()
    }

    pub fn get_inbox_messages(&self) -> Vec<Message> {
        let now = self.collaborators.clock.now();
        self.snapshot
            .borrow()
            .values()
            .filter(|message| message.save_to_inbox && message.is_valid(now))
            .cloned()
            .collect()
    }

    pub fn get_unread_inbox_count(&self) -> usize {
        self.get_inbox_messages()
            .iter()
            .filter(|message| !message.read)
            .count()
    }

    /// Looks a message up by id, whatever its state.
    pub fn get_message(&self, message_id: &str) -> Option<Message> {
        self.snapshot.borrow().get(message_id).cloned()
    }

    pub fn scheduler_phase(&self) -> SchedulerPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe_inbox_changes(&self) -> broadcast::Receiver<InboxChanged> {
        self.notifier.subscribe()
    }

    // ============================================================================
    // COMMANDS
    // ============================================================================

    /// Announces the restored inbox, if any, and runs the first sync in the
    /// background.
    pub fn start(&self) -> Result<()> {
        if !self.get_inbox_messages().is_empty() {
            self.notifier.emit();
        }
        self.lanes
            .senders
            .sync
            .send(SyncRequest::Sync { reply: None })
            .map_err(|_| InAppError::LaneClosed("sync"))
    }

    /// Fetches the server list and merges it in. Completes once the merged
    /// map is published; a failed fetch leaves the map untouched.
    pub async fn schedule_sync(&self) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.lanes
            .senders
            .sync
            .send(SyncRequest::Sync { reply: Some(reply) })
            .map_err(|_| InAppError::LaneClosed("sync"))?;
        result.await.map_err(|_| InAppError::LaneClosed("sync"))?
    }

    /// Syncs unless the last sync is more recent than the foreground sync
    /// interval. Returns whether a sync ran.
    pub async fn on_app_entered_foreground(&self) -> Result<bool> {
        let (reply, result) = oneshot::channel();
        self.lanes
            .senders
            .sync
            .send(SyncRequest::Foreground { reply })
            .map_err(|_| InAppError::LaneClosed("sync"))?;
        result.await.map_err(|_| InAppError::LaneClosed("sync"))?
    }

    /// Shows `message` now, bypassing the trigger processor and the display
    /// gate. Completes once the message is on screen and marked read.
    ///
    /// `callback` receives the clicked URL before the engine handles it.
    pub async fn show(
        &self,
        message: &Message,
        consume: bool,
        callback: Option<UrlCallback>,
    ) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.lanes
            .senders
            .ui
            .send(UiCommand {
                message: message.clone(),
                consume,
                origin: ShowOrigin::Manual,
                callback,
                reply: Some(reply),
            })
            .map_err(|_| InAppError::LaneClosed("ui"))?;
        result.await.map_err(|_| InAppError::LaneClosed("ui"))?
    }

    /// Consumes `message` and reports it. Removals from the inbox carry the
    /// current inbox session id.
    pub async fn remove(
        &self,
        message: &Message,
        location: InAppLocation,
        source: Option<InAppDeleteSource>,
    ) -> Result<()> {
        let inbox_session_id = match location {
            InAppLocation::Inbox => self.inbox_sessions.lock().await.current_id(),
            InAppLocation::InApp => None,
        };

        let (reply, result) = oneshot::channel();
        self.send_mutation(MutationCommand::Remove {
            message_id: message.id.clone(),
            location,
            source,
            inbox_session_id,
            reply: Some(reply),
        })?;
        result.await.map_err(|_| InAppError::LaneClosed("mutation"))?
    }

    pub async fn set_read(&self, read: bool, message: &Message) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.send_mutation(MutationCommand::Update {
            message_id: message.id.clone(),
            change: MessageChange::Read(read),
            reply,
        })?;
        let updated = result
            .await
            .map_err(|_| InAppError::LaneClosed("mutation"))?;

        match updated {
            Some(updated) => {
                report_read_state(self.collaborators.reporter.clone(), updated.id, read);
                Ok(())
            }
            None => Err(InAppError::MessageNotFound(message.id.clone())),
        }
    }

    /// Drops a message the server says no longer exists. Nothing is
    /// reported. Returns whether the message was present.
    pub async fn on_server_removed(&self, message_id: &str) -> Result<bool> {
        let (reply, result) = oneshot::channel();
        self.send_mutation(MutationCommand::ServerRemoved {
            message_id: message_id.to_string(),
            reply,
        })?;
        result.await.map_err(|_| InAppError::LaneClosed("mutation"))
    }

    /// Forgets every message, in memory and in the store.
    pub async fn reset(&self) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.send_mutation(MutationCommand::Reset { reply })?;
        result.await.map_err(|_| InAppError::LaneClosed("mutation"))?
    }

    pub fn is_auto_display_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Pauses or resumes automatic display. Resuming runs a background sync
    /// so pending messages get their turn.
    pub fn set_auto_display_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        tracing::debug!(
            target: "inapp_engine::set_auto_display_paused",
            "Automatic display paused: {}",
            paused
        );
        if !paused
            && self
                .lanes
                .senders
                .sync
                .send(SyncRequest::Sync { reply: None })
                .is_err()
        {
            tracing::warn!(
                target: "inapp_engine::set_auto_display_paused",
                "Sync lane is gone, not syncing after resume"
            );
        }
    }

    /// Opens an inbox session and returns its id. Starting a new session
    /// discards one that was never ended.
    pub async fn start_inbox_session(&self) -> String {
        let inbox = self.get_inbox_messages();
        let unread = inbox.iter().filter(|message| !message.read).count();
        let now = self.collaborators.clock.now();
        self.inbox_sessions
            .lock()
            .await
            .start(now, inbox.len(), unread)
    }

    /// Closes the open inbox session and reports it. `None` when no session
    /// was open.
    pub async fn end_inbox_session(&self) -> Option<InboxSession> {
        let inbox = self.get_inbox_messages();
        let unread = inbox.iter().filter(|message| !message.read).count();
        let now = self.collaborators.clock.now();
        let session = self
            .inbox_sessions
            .lock()
            .await
            .end(now, inbox.len(), unread)?;

        if let Err(e) = self
            .collaborators
            .reporter
            .track_inbox_session(&session)
            .await
        {
            tracing::warn!(
                target: "inapp_engine::end_inbox_session",
                "Failed to track inbox session {}: {}",
                session.id,
                e
            );
        }
        Some(session)
    }

    /// Stops every lane after it drains its queue. Calls made afterwards fail
    /// with [`InAppError::LaneClosed`].
    pub async fn shutdown(&self) {
        tracing::info!(target: "inapp_engine::shutdown", "Shutting down in-app engine");
        self.lanes.shutdown().await;
    }

    fn send_mutation(&self, command: MutationCommand) -> Result<()> {
        self.lanes
            .senders
            .mutation
            .send(command)
            .map_err(|_| InAppError::LaneClosed("mutation"))
    }
}


#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, Utc};
    use serde_json::json;

    use super::test_utils::*;
    use super::*;
    use crate::inapp::collaborators::DisplayOutcome;

    const NO_GAP: Duration = Duration::ZERO;

    fn never_triggered(id: &str, save_to_inbox: bool) -> serde_json::Value {
        json!({
            "messageId": id,
            "content": {"html": "<p>inbox</p>"},
            "trigger": {"type": "never"},
            "saveToInbox": save_to_inbox,
        })
    }

    #[test]
    fn test_config_defaults_and_env_suffix() {
        let (config, data_dir, logs_dir) = create_test_config();
        let suffix = if cfg!(debug_assertions) { "dev" } else { "release" };

        assert_eq!(config.data_dir, data_dir.path().join(suffix));
        assert_eq!(config.logs_dir, logs_dir.path().join(suffix));
        assert_eq!(config.display_interval, DEFAULT_DISPLAY_INTERVAL);
        assert_eq!(
            config.move_to_foreground_sync_interval,
            DEFAULT_FOREGROUND_SYNC_INTERVAL
        );
        assert!(config.allowed_protocols.is_empty());

        let config = config
            .with_display_interval(Duration::from_secs(5))
            .with_foreground_sync_interval(Duration::from_secs(1))
            .with_allowed_protocols(["myapp", "other"]);
        assert_eq!(config.display_interval, Duration::from_secs(5));
        assert_eq!(config.move_to_foreground_sync_interval, Duration::from_secs(1));
        assert_eq!(config.allowed_protocols, vec!["myapp", "other"]);
    }

    #[tokio::test]
    async fn test_initialize_creates_directories_and_store() {
        let (config, _data_dir, _logs_dir) = create_test_config();
        let collaborators = Collaborators::new(
            Arc::new(MockFetcher::new(payload(vec![]))),
            Arc::new(MockDisplayer::new(DisplayMode::Hold)),
            Arc::new(MockReporter::default()),
        );

        let manager = InAppManager::initialize(config.clone(), collaborators)
            .await
            .unwrap();

        assert!(config.data_dir.exists());
        assert!(config.logs_dir.exists());
        assert!(config.data_dir.join("inapp_messages.sqlite").exists());
        assert!(manager.get_messages().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_recovers_from_corrupt_store() {
        let (config, _data_dir, _logs_dir) = create_test_config();
        std::fs::create_dir_all(&config.data_dir).unwrap();
        std::fs::write(
            config.data_dir.join("inapp_messages.sqlite"),
            b"garbage left behind by a crash",
        )
        .unwrap();
        let collaborators = Collaborators::new(
            Arc::new(MockFetcher::new(payload(vec![message_json("a", 1.0)]))),
            Arc::new(MockDisplayer::new(DisplayMode::Hold)),
            Arc::new(MockReporter::default()),
        );

        let manager = InAppManager::initialize(config, collaborators)
            .await
            .unwrap();
        assert!(manager.get_messages().is_empty());

        manager.schedule_sync().await.unwrap();
        assert_eq!(manager.get_messages().len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_installs_messages_and_reports_delivery() {
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, vec![]).await;
        harness.fetcher.set_payload(payload(vec![
            never_triggered("inbox", true),
            never_triggered("hidden", false),
        ]));

        harness.manager.schedule_sync().await.unwrap();

        let ids: Vec<String> = harness
            .manager
            .get_messages()
            .into_iter()
            .map(|message| message.id)
            .collect();
        assert_eq!(ids, vec!["inbox", "hidden"]);
        assert_eq!(harness.manager.get_inbox_messages().len(), 1);
        assert_eq!(harness.manager.get_unread_inbox_count(), 1);
        assert_eq!(harness.persister.stored().len(), 2);

        let reporter = harness.reporter.clone();
        wait_until(|| reporter.delivered_ids().len() == 2).await;
        assert!(harness.displayer.shown_ids().is_empty());
    }

    #[tokio::test]
    async fn test_messages_are_shown_in_priority_order() {
        let harness = create_test_manager(NO_GAP, DisplayMode::AutoDismiss, vec![]).await;
        harness.fetcher.set_payload(payload(vec![
            message_json("x", 5.0),
            message_json("y", 1.0),
            message_json("z", 3.0),
        ]));

        harness.manager.schedule_sync().await.unwrap();

        let displayer = harness.displayer.clone();
        wait_until(|| displayer.shown_ids().len() == 3).await;
        assert_eq!(displayer.shown_ids(), vec!["y", "z", "x"]);

        // Each display waits out the guard after the previous dismissal.
        let shown_at = displayer.shown_at();
        for pair in shown_at.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= scheduler::DISPLAY_GUARD);
        }

        let reporter = harness.reporter.clone();
        wait_until(|| reporter.consumed().len() == 3).await;
        assert!(harness.manager.get_messages().is_empty());
    }

    #[tokio::test]
    async fn test_display_interval_throttles_second_message() {
        let harness =
            create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::AutoDismiss, vec![]).await;
        harness
            .fetcher
            .set_payload(payload(vec![message_json("a", 1.0), message_json("b", 2.0)]));

        harness.manager.schedule_sync().await.unwrap();

        let manager = &harness.manager;
        wait_until(|| matches!(manager.scheduler_phase(), SchedulerPhase::Waiting { .. })).await;
        assert_eq!(harness.displayer.shown_ids(), vec!["a"]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.displayer.shown_ids(), vec!["a"]);
        assert!(!manager.get_message("b").unwrap().did_process_trigger);
    }

    #[tokio::test]
    async fn test_display_gap_spaces_out_queued_messages() {
        let gap = Duration::from_millis(300);
        let harness = create_test_manager(gap, DisplayMode::AutoDismiss, vec![]).await;
        harness.fetcher.set_payload(payload(vec![
            message_json("x", 5.0),
            message_json("y", 1.0),
            message_json("z", 3.0),
        ]));

        harness.manager.schedule_sync().await.unwrap();

        let displayer = harness.displayer.clone();
        wait_until(|| displayer.shown_ids().len() == 3).await;
        assert_eq!(displayer.shown_ids(), vec!["y", "z", "x"]);

        // AutoDismiss closes each message right away, so the spacing comes
        // from the schedule lane waking up after the gap.
        let shown_at = displayer.shown_at();
        for pair in shown_at.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= gap);
        }
    }

    #[tokio::test]
    async fn test_concurrent_syncs_are_serialized() {
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, vec![]).await;
        harness.fetcher.set_payload(payload(vec![
            never_triggered("one", true),
            never_triggered("two", false),
        ]));

        let manager = &harness.manager;
        let results =
            futures::future::join_all((0..4).map(|_| manager.schedule_sync())).await;

        assert!(results.iter().all(|result| result.is_ok()));
        assert_eq!(harness.fetcher.fetch_count(), 4);
        assert_eq!(manager.get_messages().len(), 2);

        // Only the first merge saw new messages.
        let reporter = harness.reporter.clone();
        wait_until(|| reporter.delivered_ids().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reporter.delivered_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_messages_are_hidden_but_kept() {
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, vec![]).await;
        let expired_at = Utc::now() - TimeDelta::hours(1);
        harness.fetcher.set_payload(payload(vec![json!({
            "messageId": "old",
            "content": {"html": "<p>old</p>"},
            "trigger": {"type": "never"},
            "saveToInbox": true,
            "expiresAt": expired_at.timestamp_millis(),
        })]));

        harness.manager.schedule_sync().await.unwrap();

        assert!(harness.manager.get_messages().is_empty());
        assert!(harness.manager.get_inbox_messages().is_empty());
        assert!(harness.manager.get_message("old").is_some());
        assert_eq!(harness.persister.stored().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_sync_leaves_state_unchanged() {
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, vec![]).await;
        harness
            .fetcher
            .set_payload(payload(vec![never_triggered("kept", true)]));
        harness.manager.schedule_sync().await.unwrap();

        harness.fetcher.set_payload(payload(vec![]));
        harness.fetcher.fail_next("connection reset");
        let result = harness.manager.schedule_sync().await;

        assert!(matches!(result, Err(InAppError::SyncFailure(_))));
        assert_eq!(harness.manager.get_messages().len(), 1);
        assert_eq!(harness.persister.stored().len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_entries_are_consumed() {
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, vec![]).await;
        harness.fetcher.set_payload(payload(vec![
            json!({"messageId": "broken"}),
            never_triggered("fine", true),
        ]));

        harness.manager.schedule_sync().await.unwrap();

        assert_eq!(harness.manager.get_messages().len(), 1);
        let reporter = harness.reporter.clone();
        wait_until(|| reporter.consumed().len() == 1).await;
        assert_eq!(reporter.consumed()[0].0, "broken");
    }

    #[tokio::test]
    async fn test_json_only_messages_are_consumed_without_display() {
        let harness = create_test_manager(NO_GAP, DisplayMode::AutoDismiss, vec![]).await;
        harness.fetcher.set_payload(payload(vec![json!({
            "messageId": "data",
            "jsonOnly": true,
            "customPayload": {"coupon": "ABC"},
        })]));

        harness.manager.schedule_sync().await.unwrap();

        let reporter = harness.reporter.clone();
        wait_until(|| reporter.consumed().len() == 1).await;
        let message = harness.manager.get_message("data").unwrap();
        assert!(message.consumed);
        assert!(message.did_process_trigger);
        assert!(harness.manager.get_messages().is_empty());
        assert!(harness.displayer.shown_ids().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_display_is_rolled_back() {
        let harness = create_test_manager(NO_GAP, DisplayMode::Reject, vec![]).await;
        harness
            .fetcher
            .set_payload(payload(vec![message_json("a", 1.0)]));

        harness.manager.schedule_sync().await.unwrap();

        let displayer = harness.displayer.clone();
        wait_until(|| displayer.attempts() == 1).await;
        let manager = &harness.manager;
        wait_until(|| {
            manager
                .get_message("a")
                .is_some_and(|message| !message.did_process_trigger && !message.consumed)
        })
        .await;
        assert!(displayer.shown_ids().is_empty());

        // With the display time rolled back the next pass may show it at once.
        displayer.set_mode(DisplayMode::AutoDismiss);
        manager.schedule_sync().await.unwrap();
        wait_until(|| displayer.shown_ids() == vec!["a"]).await;
    }

    #[tokio::test]
    async fn test_paused_engine_shows_nothing_until_resumed() {
        let harness = create_test_manager(NO_GAP, DisplayMode::AutoDismiss, vec![]).await;
        harness
            .fetcher
            .set_payload(payload(vec![message_json("a", 1.0)]));

        harness.manager.set_auto_display_paused(true);
        assert!(harness.manager.is_auto_display_paused());
        harness.manager.schedule_sync().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(harness.displayer.shown_ids().is_empty());
        assert_eq!(harness.manager.get_messages().len(), 1);

        harness.manager.set_auto_display_paused(false);
        let displayer = harness.displayer.clone();
        wait_until(|| displayer.shown_ids() == vec!["a"]).await;
    }

    #[tokio::test]
    async fn test_inactive_app_defers_processing() {
        let harness = create_test_manager(NO_GAP, DisplayMode::AutoDismiss, vec![]).await;
        harness.app_state.set_active(false);
        harness
            .fetcher
            .set_payload(payload(vec![message_json("a", 1.0)]));

        harness.manager.schedule_sync().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(harness.displayer.shown_ids().is_empty());

        harness.app_state.set_active(true);
        harness.manager.schedule_sync().await.unwrap();
        let displayer = harness.displayer.clone();
        wait_until(|| displayer.shown_ids() == vec!["a"]).await;
    }

    #[tokio::test]
    async fn test_manual_show_with_click() {
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, vec![]).await;
        harness
            .fetcher
            .set_payload(payload(vec![never_triggered("promo", false)]));
        harness.manager.schedule_sync().await.unwrap();
        let message = harness.manager.get_message("promo").unwrap();

        let (url_tx, url_rx) = oneshot::channel::<String>();
        let callback: UrlCallback = Box::new(move |url: &str| {
            let _ = url_tx.send(url.to_string());
        });
        harness
            .manager
            .show(&message, true, Some(callback))
            .await
            .unwrap();

        let shown = harness.manager.get_message("promo").unwrap();
        assert!(shown.read);
        assert!(shown.consumed);
        assert!(shown.did_process_trigger);
        assert_eq!(
            harness.manager.scheduler_phase(),
            SchedulerPhase::Displaying {
                message_id: "promo".to_string()
            }
        );

        assert!(harness
            .displayer
            .finish(DisplayOutcome::Clicked("https://example.com/offer".to_string())));
        assert_eq!(url_rx.await.unwrap(), "https://example.com/offer");

        let reporter = harness.reporter.clone();
        wait_until(|| reporter.consumed().len() == 1).await;
        assert_eq!(
            harness.action_handler.handled(),
            vec![HandledAction::OpenUrl("https://example.com/offer".to_string())]
        );
        let manager = &harness.manager;
        wait_until(|| !manager.scheduler_phase().is_displaying()).await;
    }

    #[tokio::test]
    async fn test_manual_show_rejected() {
        let harness = create_test_manager(NO_GAP, DisplayMode::Reject, vec![]).await;
        let message = sample_message("m1");

        let result = harness.manager.show(&message, true, None).await;
        assert!(matches!(result, Err(InAppError::DisplayRejected(_))));
        assert_eq!(harness.manager.scheduler_phase(), SchedulerPhase::Idle);
    }

    #[tokio::test]
    async fn test_json_only_manual_show_is_rejected() {
        let harness = create_test_manager(NO_GAP, DisplayMode::AutoDismiss, vec![]).await;
        let mut message = sample_message("data");
        message.json_only = true;

        let result = harness.manager.show(&message, true, None).await;
        assert!(matches!(result, Err(InAppError::DisplayRejected(_))));
        assert_eq!(harness.displayer.attempts(), 0);
    }

    #[tokio::test]
    async fn test_delete_action_removes_message() {
        let mode = DisplayMode::Click("iterable://delete".to_string());
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, mode, vec![]).await;
        harness
            .fetcher
            .set_payload(payload(vec![never_triggered("inbox", true)]));
        harness.manager.schedule_sync().await.unwrap();
        let message = harness.manager.get_message("inbox").unwrap();

        harness.manager.show(&message, false, None).await.unwrap();

        let manager = &harness.manager;
        wait_until(|| manager.get_inbox_messages().is_empty()).await;
        let reporter = harness.reporter.clone();
        wait_until(|| reporter.consumed().len() == 1).await;
        let (id, context) = reporter.consumed().remove(0);
        assert_eq!(id, "inbox");
        assert_eq!(context.location, InAppLocation::InApp);
        assert_eq!(context.source, Some(InAppDeleteSource::DeleteButton));
        assert!(harness.action_handler.handled().is_empty());
    }

    #[tokio::test]
    async fn test_remove_from_inbox_carries_session_id() {
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, vec![]).await;
        harness.fetcher.set_payload(payload(vec![
            never_triggered("one", true),
            never_triggered("two", true),
        ]));
        harness.manager.schedule_sync().await.unwrap();
        let mut changes = harness.manager.subscribe_inbox_changes();

        let session_id = harness.manager.start_inbox_session().await;
        let message = harness.manager.get_message("one").unwrap();
        harness
            .manager
            .remove(&message, InAppLocation::Inbox, Some(InAppDeleteSource::InboxSwipe))
            .await
            .unwrap();

        assert!(changes.recv().await.is_ok());
        let ids: Vec<String> = harness
            .manager
            .get_inbox_messages()
            .into_iter()
            .map(|message| message.id)
            .collect();
        assert_eq!(ids, vec!["two"]);
        assert!(harness.manager.get_message("one").unwrap().consumed);

        let reporter = harness.reporter.clone();
        wait_until(|| reporter.consumed().len() == 1).await;
        let (_, context) = reporter.consumed().remove(0);
        assert_eq!(context.location, InAppLocation::Inbox);
        assert_eq!(context.source, Some(InAppDeleteSource::InboxSwipe));
        assert_eq!(context.inbox_session_id, Some(session_id));
        assert!(context.save_to_inbox);
    }

    #[tokio::test]
    async fn test_remove_unknown_message() {
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, vec![]).await;
        let result = harness
            .manager
            .remove(&sample_message("ghost"), InAppLocation::InApp, None)
            .await;
        assert!(matches!(result, Err(InAppError::MessageNotFound(id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_set_read_updates_unread_count() {
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, vec![]).await;
        harness.fetcher.set_payload(payload(vec![
            never_triggered("one", true),
            never_triggered("two", true),
        ]));
        harness.manager.schedule_sync().await.unwrap();
        assert_eq!(harness.manager.get_unread_inbox_count(), 2);

        let message = harness.manager.get_message("one").unwrap();
        harness.manager.set_read(true, &message).await.unwrap();
        assert_eq!(harness.manager.get_unread_inbox_count(), 1);
        assert!(harness.persister.stored()[0].read);

        let reporter = harness.reporter.clone();
        wait_until(|| {
            reporter
                .calls()
                .contains(&Reported::ReadState("one".to_string(), true))
        })
        .await;

        let result = harness.manager.set_read(true, &sample_message("ghost")).await;
        assert!(matches!(result, Err(InAppError::MessageNotFound(_))));
    }

    #[tokio::test]
    async fn test_server_removed_is_silent() {
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, vec![]).await;
        harness
            .fetcher
            .set_payload(payload(vec![never_triggered("one", false)]));
        harness.manager.schedule_sync().await.unwrap();

        assert!(harness.manager.on_server_removed("one").await.unwrap());
        assert!(!harness.manager.on_server_removed("one").await.unwrap());
        assert!(harness.manager.get_message("one").is_none());
        assert!(harness.persister.stored().is_empty());
        assert!(harness.reporter.consumed().is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_memory_and_store() {
        let harness = create_test_manager(
            DEFAULT_DISPLAY_INTERVAL,
            DisplayMode::Hold,
            vec![sample_message("a"), sample_message("b")],
        )
        .await;
        assert_eq!(harness.manager.get_messages().len(), 2);

        harness.manager.reset().await.unwrap();

        assert!(harness.manager.get_messages().is_empty());
        assert!(harness.persister.stored().is_empty());
    }

    #[tokio::test]
    async fn test_restored_inbox_is_announced_on_start() {
        let mut restored = sample_message("saved");
        restored.save_to_inbox = true;
        restored.did_process_trigger = true;
        let stored = vec![restored.clone(), restored];
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, stored).await;

        // Duplicate records collapse into one.
        assert_eq!(harness.manager.get_inbox_messages().len(), 1);

        let mut changes = harness.manager.subscribe_inbox_changes();
        harness.manager.start().unwrap();
        assert!(changes.recv().await.is_ok());

        let fetcher = harness.fetcher.clone();
        wait_until(|| fetcher.fetch_count() == 1).await;
    }

    #[tokio::test]
    async fn test_foreground_sync_is_throttled() {
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, vec![]).await;

        assert!(harness.manager.on_app_entered_foreground().await.unwrap());
        assert!(!harness.manager.on_app_entered_foreground().await.unwrap());
        assert_eq!(harness.fetcher.fetch_count(), 1);

        // An explicit sync is never throttled.
        harness.manager.schedule_sync().await.unwrap();
        assert_eq!(harness.fetcher.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_inbox_session_is_reported() {
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, vec![]).await;
        harness.fetcher.set_payload(payload(vec![
            never_triggered("one", true),
            never_triggered("two", true),
        ]));
        harness.manager.schedule_sync().await.unwrap();

        assert!(harness.manager.end_inbox_session().await.is_none());

        let session_id = harness.manager.start_inbox_session().await;
        let message = harness.manager.get_message("one").unwrap();
        harness.manager.set_read(true, &message).await.unwrap();
        let session = harness.manager.end_inbox_session().await.unwrap();

        assert_eq!(session.id, session_id);
        assert_eq!(session.start_total_message_count, 2);
        assert_eq!(session.start_unread_message_count, 2);
        assert_eq!(session.end_total_message_count, 2);
        assert_eq!(session.end_unread_message_count, 1);
        assert!(harness
            .reporter
            .calls()
            .contains(&Reported::InboxSession(session)));
    }

    #[tokio::test]
    async fn test_calls_fail_after_shutdown() {
        let harness = create_test_manager(DEFAULT_DISPLAY_INTERVAL, DisplayMode::Hold, vec![]).await;
        harness.manager.shutdown().await;

        assert!(matches!(
            harness.manager.schedule_sync().await,
            Err(InAppError::LaneClosed(_))
        ));
        assert!(matches!(
            harness.manager.reset().await,
            Err(InAppError::LaneClosed(_))
        ));
    }
}
