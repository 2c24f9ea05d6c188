use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};

use super::{report_consume, LaneContext, MutationCommand, SyncRequest};
use crate::inapp::collaborators::{ConsumeContext, InAppLocation};
use crate::inapp::error::{InAppError, Result};
use crate::inapp::message::Message;
use crate::inapp::parser::parse_payload;
use crate::inapp::scheduler::wait_time;

/// Handles sync requests strictly one after another. A request that arrives
/// while a sync is running waits in the channel until it is done.
pub(super) async fn run(
    context: LaneContext,
    mutation: mpsc::UnboundedSender<MutationCommand>,
    mut receiver: mpsc::UnboundedReceiver<SyncRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lane = SyncLane {
        context,
        mutation,
        last_sync_time: None,
    };

    loop {
        tokio::select! {
            Some(request) = receiver.recv() => {
                lane.handle(request).await;
            }
            _ = shutdown.changed() => {
                tracing::debug!(
                    target: "inapp_engine::lanes::sync::run",
                    "Received shutdown signal, finishing current queue..."
                );
                while let Ok(request) = receiver.try_recv() {
                    lane.handle(request).await;
                }
                break;
            }
        }
    }
}

struct SyncLane {
    context: LaneContext,
    mutation: mpsc::UnboundedSender<MutationCommand>,
    last_sync_time: Option<DateTime<Utc>>,
}

impl SyncLane {
    async fn handle(&mut self, request: SyncRequest) {
        match request {
            SyncRequest::Sync { reply } => {
                let result = self.sync().await;
                if let Err(e) = &result {
                    tracing::warn!(
                        target: "inapp_engine::lanes::sync::handle",
                        "Sync failed: {}",
                        e
                    );
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            SyncRequest::Foreground { reply } => {
                let now = self.context.collaborators.clock.now();
                let wait = wait_time(
                    self.last_sync_time,
                    now,
                    self.context.config.move_to_foreground_sync_interval,
                );
                let result = if wait.is_zero() {
                    self.sync().await.map(|()| true)
                } else {
                    tracing::debug!(
                        target: "inapp_engine::lanes::sync::handle",
                        "Skipping foreground sync, next allowed in {:?}",
                        wait
                    );
                    Ok(false)
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Fetch, normalize and install. The map is untouched when the fetch fails.
    async fn sync(&mut self) -> Result<()> {
        let collaborators = &self.context.collaborators;
        let app_ready = collaborators.app_state.is_active() && !collaborators.displayer.is_showing();

        let payload = collaborators
            .fetcher
            .fetch()
            .await
            .map_err(|e| InAppError::SyncFailure(e.to_string()))?;

        let mut messages: Vec<Message> = Vec::new();
        for parsed in parse_payload(&payload) {
            match parsed {
                Ok(message) => messages.push(message),
                Err(e) => {
                    tracing::warn!(
                        target: "inapp_engine::lanes::sync::sync",
                        "{}",
                        e
                    );
                    // Consume it so the server stops sending it.
                    if let Some(message_id) = e.message_id {
                        report_consume(
                            collaborators.reporter.clone(),
                            message_id,
                            ConsumeContext {
                                location: InAppLocation::InApp,
                                source: None,
                                inbox_session_id: None,
                                save_to_inbox: false,
                            },
                        );
                    }
                }
            }
        }

        tracing::debug!(
            target: "inapp_engine::lanes::sync::sync",
            "Fetched {} messages, app ready: {}",
            messages.len(),
            app_ready
        );

        let (reply, installed) = oneshot::channel();
        self.mutation
            .send(MutationCommand::InstallSync {
                messages,
                process: app_ready,
                reply,
            })
            .map_err(|_| InAppError::LaneClosed("mutation"))?;
        installed
            .await
            .map_err(|_| InAppError::LaneClosed("mutation"))?;

        self.last_sync_time = Some(collaborators.clock.now());
        Ok(())
    }
}
