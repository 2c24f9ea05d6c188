//! The engine's serial execution lanes.
//!
//! Each lane is one tokio task draining one unbounded channel, so lanes never
//! block on each other:
//!
//! - mutation: sole owner of the message map and the display scheduler
//! - sync: fetch, normalize and hand the result to the mutation lane, one at a time
//! - schedule: a single deadline that turns into `ProcessPending`
//! - ui: the only task allowed to call [`Displayer::show`](crate::inapp::collaborators::Displayer::show)
//!
//! All lanes stop on the shared shutdown signal after draining what is
//! already queued.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::inapp::collaborators::{
    Collaborators, ConsumeContext, InAppDeleteSource, InAppLocation, Reporter, UrlCallback,
};
use crate::inapp::error::Result;
use crate::inapp::message::{Message, MessageMap};
use crate::inapp::notifications::InboxNotifier;
use crate::inapp::persistence::Persister;
use crate::inapp::scheduler::SchedulerPhase;
use crate::inapp::InAppConfig;

mod mutation;
mod schedule;
mod sync;
mod ui;

pub(crate) type Reply<T> = oneshot::Sender<T>;

/// Field changes applied by [`MutationCommand::Update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageChange {
    Read(bool),
}

pub(crate) enum MutationCommand {
    /// Merge a fresh server list, then optionally look for something to show.
    InstallSync {
        messages: Vec<Message>,
        process: bool,
        reply: Reply<()>,
    },
    /// Re-run candidate selection.
    ProcessPending,
    Update {
        message_id: String,
        change: MessageChange,
        reply: Reply<Option<Message>>,
    },
    Remove {
        message_id: String,
        location: InAppLocation,
        source: Option<InAppDeleteSource>,
        inbox_session_id: Option<String>,
        reply: Option<Reply<Result<()>>>,
    },
    ServerRemoved {
        message_id: String,
        reply: Reply<bool>,
    },
    Reset {
        reply: Reply<Result<()>>,
    },
    /// The displayer accepted the message.
    DisplayStarted {
        message_id: String,
        consume: bool,
        reply: Option<Reply<Result<()>>>,
    },
    /// The displayer declined an automatically selected message.
    DisplayRejected {
        message_id: String,
        previous_display_time: Option<DateTime<Utc>>,
    },
    /// The message on screen was clicked or closed.
    Dismissed,
}

pub(crate) enum SyncRequest {
    Sync { reply: Option<Reply<Result<()>>> },
    /// Sync only when the foreground interval has passed since the last one.
    Foreground { reply: Reply<Result<bool>> },
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ShowOrigin {
    /// Selected by the trigger processor.
    Auto {
        previous_display_time: Option<DateTime<Utc>>,
    },
    /// Requested by the host.
    Manual,
}

pub(crate) struct UiCommand {
    pub message: Message,
    pub consume: bool,
    pub origin: ShowOrigin,
    pub callback: Option<UrlCallback>,
    pub reply: Option<Reply<Result<()>>>,
}

#[derive(Clone, Debug)]
pub(crate) struct LaneSenders {
    pub mutation: mpsc::UnboundedSender<MutationCommand>,
    pub sync: mpsc::UnboundedSender<SyncRequest>,
    pub schedule: mpsc::UnboundedSender<Instant>,
    pub ui: mpsc::UnboundedSender<UiCommand>,
}

/// Read-only state shared by every lane.
#[derive(Clone)]
pub(crate) struct LaneContext {
    pub config: InAppConfig,
    pub collaborators: Collaborators,
    pub notifier: InboxNotifier,
}

/// What the manager reads from the lanes.
pub(crate) struct LaneViews {
    pub snapshot: watch::Receiver<Arc<MessageMap>>,
    pub phase: watch::Receiver<SchedulerPhase>,
}

pub(crate) struct Lanes {
    pub senders: LaneSenders,
    shutdown: watch::Sender<bool>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Lanes {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl Lanes {
    /// Spawns every lane. Must be called from within a tokio runtime.
    pub fn spawn(
        context: LaneContext,
        persister: Arc<dyn Persister>,
        paused: Arc<AtomicBool>,
        initial: MessageMap,
    ) -> (Self, LaneViews) {
        let (mutation_tx, mutation_rx) = mpsc::unbounded_channel();
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let senders = LaneSenders {
            mutation: mutation_tx,
            sync: sync_tx,
            schedule: schedule_tx,
            ui: ui_tx,
        };

        let (mutation_lane, views) = mutation::MutationLane::new(
            context.clone(),
            persister,
            paused,
            initial,
            senders.clone(),
        );

        let handles = vec![
            tokio::spawn(mutation_lane.run(mutation_rx, shutdown_tx.subscribe())),
            tokio::spawn(sync::run(
                context.clone(),
                senders.mutation.clone(),
                sync_rx,
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(schedule::run(
                senders.mutation.clone(),
                schedule_rx,
                shutdown_tx.subscribe(),
            )),
            ui::spawn(context, senders.clone(), ui_rx, shutdown_tx.subscribe()),
        ];

        let lanes = Self {
            senders,
            shutdown: shutdown_tx,
            handles: tokio::sync::Mutex::new(handles),
        };
        (lanes, views)
    }

    /// Signals every lane to stop and waits for them to drain.
    pub async fn shutdown(&self) {
        // No receivers left means the lanes are already gone.
        let _ = self.shutdown.send(true);

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(
                    target: "inapp_engine::lanes::shutdown",
                    "Lane task ended abnormally: {}",
                    e
                );
            }
        }
    }
}

/// Reporter calls never hold up a lane. Failures are logged and dropped.
pub(crate) fn report_delivery(reporter: Arc<dyn Reporter>, message: Message) {
    tokio::spawn(async move {
        if let Err(e) = reporter.track_delivery(&message).await {
            tracing::warn!(
                target: "inapp_engine::lanes::report_delivery",
                "Failed to track delivery of {}: {}",
                message.id,
                e
            );
        }
    });
}

pub(crate) fn report_consume(
    reporter: Arc<dyn Reporter>,
    message_id: String,
    context: ConsumeContext,
) {
    tokio::spawn(async move {
        if let Err(e) = reporter.track_consume(&message_id, &context).await {
            tracing::warn!(
                target: "inapp_engine::lanes::report_consume",
                "Failed to track consumption of {}: {}",
                message_id,
                e
            );
        }
    });
}

pub(crate) fn report_read_state(reporter: Arc<dyn Reporter>, message_id: String, read: bool) {
    tokio::spawn(async move {
        if let Err(e) = reporter.track_read_state(&message_id, read).await {
            tracing::warn!(
                target: "inapp_engine::lanes::report_read_state",
                "Failed to track read state of {}: {}",
                message_id,
                e
            );
        }
    });
}

/// Consumption of a message shown in-app or consumed without display.
pub(crate) fn in_app_consume_context(message: &Message) -> ConsumeContext {
    ConsumeContext {
        location: InAppLocation::InApp,
        source: None,
        inbox_session_id: None,
        save_to_inbox: message.save_to_inbox,
    }
}
