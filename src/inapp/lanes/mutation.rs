use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::{
    in_app_consume_context, report_consume, report_delivery, LaneContext, LaneSenders, LaneViews,
    MessageChange, MutationCommand, ShowOrigin, UiCommand,
};
use crate::inapp::collaborators::{ConsumeContext, InAppDeleteSource, InAppLocation};
use crate::inapp::error::{InAppError, Result};
use crate::inapp::merge::merge_messages;
use crate::inapp::message::{Message, MessageMap};
use crate::inapp::persistence::Persister;
use crate::inapp::processor::{MessagesProcessor, ProcessorResult};
use crate::inapp::scheduler::{DisplayScheduler, SchedulerPhase};

/// Owns the canonical map. Every write happens here, in submission order,
/// followed by a snapshot publish and a save.
pub(super) struct MutationLane {
    context: LaneContext,
    persister: Arc<dyn Persister>,
    messages: MessageMap,
    scheduler: DisplayScheduler,
    snapshot_tx: watch::Sender<Arc<MessageMap>>,
    phase_tx: watch::Sender<SchedulerPhase>,
    senders: LaneSenders,
}

impl MutationLane {
    pub(super) fn new(
        context: LaneContext,
        persister: Arc<dyn Persister>,
        paused: Arc<AtomicBool>,
        initial: MessageMap,
        senders: LaneSenders,
    ) -> (Self, LaneViews) {
        let scheduler = DisplayScheduler::new(
            context.config.display_interval,
            paused,
            context.collaborators.clock.clone(),
        );
        let (snapshot_tx, snapshot) = watch::channel(Arc::new(initial.clone()));
        let (phase_tx, phase) = watch::channel(SchedulerPhase::Idle);

        let lane = Self {
            context,
            persister,
            messages: initial,
            scheduler,
            snapshot_tx,
            phase_tx,
            senders,
        };
        (lane, LaneViews { snapshot, phase })
    }

    pub(super) async fn run(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<MutationCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::debug!(
            target: "inapp_engine::lanes::mutation::run",
            "Starting mutation lane"
        );

        loop {
            tokio::select! {
                Some(command) = receiver.recv() => {
                    self.handle(command).await;
                }
                _ = shutdown.changed() => {
                    tracing::debug!(
                        target: "inapp_engine::lanes::mutation::run",
                        "Received shutdown signal, finishing current queue..."
                    );
                    while let Ok(command) = receiver.try_recv() {
                        self.handle(command).await;
                    }
                    break;
                }
            }
        }

        tracing::debug!(
            target: "inapp_engine::lanes::mutation::run",
            "Mutation lane stopped"
        );
    }

    async fn handle(&mut self, command: MutationCommand) {
        match command {
            MutationCommand::InstallSync {
                messages,
                process,
                reply,
            } => {
                self.install_sync(messages, process).await;
                let _ = reply.send(());
            }
            MutationCommand::ProcessPending => {
                self.scheduler.clear_waiting();
                if self.context.collaborators.app_state.is_active() {
                    self.process_pending().await;
                } else {
                    tracing::debug!(
                        target: "inapp_engine::lanes::mutation::handle",
                        "App is not active, not processing messages"
                    );
                }
            }
            MutationCommand::Update {
                message_id,
                change,
                reply,
            } => {
                let updated = self.update(&message_id, change).await;
                let _ = reply.send(updated);
            }
            MutationCommand::Remove {
                message_id,
                location,
                source,
                inbox_session_id,
                reply,
            } => {
                let result = self
                    .remove(&message_id, location, source, inbox_session_id)
                    .await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            MutationCommand::ServerRemoved { message_id, reply } => {
                let removed = self.server_removed(&message_id).await;
                let _ = reply.send(removed);
            }
            MutationCommand::Reset { reply } => {
                let result = self.reset().await;
                let _ = reply.send(result);
            }
            MutationCommand::DisplayStarted {
                message_id,
                consume,
                reply,
            } => {
                self.display_started(&message_id, consume).await;
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            MutationCommand::DisplayRejected {
                message_id,
                previous_display_time,
            } => {
                self.display_rejected(&message_id, previous_display_time)
                    .await;
            }
            MutationCommand::Dismissed => {
                self.scheduler.record_dismissal();
                self.schedule_next();
            }
        }
        self.publish_phase();
    }

    async fn install_sync(&mut self, server: Vec<Message>, process: bool) {
        let result = merge_messages(&self.messages, server);
        self.messages = result.messages;
        self.commit().await;

        for message in result.delivered_messages {
            report_delivery(self.context.collaborators.reporter.clone(), message);
        }
        if result.inbox_changed {
            self.context.notifier.emit();
        }
        if process {
            self.process_pending().await;
        }
    }

    /// Runs candidate selection until something is shown or nothing more can
    /// be done right now. Json-only messages consumed along the way do not end
    /// the pass.
    async fn process_pending(&mut self) {
        if self.scheduler.phase().is_displaying() {
            tracing::debug!(
                target: "inapp_engine::lanes::mutation::process_pending",
                "A message is already on screen, waiting for dismissal"
            );
            return;
        }

        loop {
            let outcome = MessagesProcessor::new(
                self.context.collaborators.delegate.as_ref(),
                &self.scheduler,
                self.messages.clone(),
            )
            .process();

            if outcome.messages != self.messages {
                self.messages = outcome.messages;
                self.commit().await;
            }

            match outcome.result {
                ProcessorResult::Show(message) => {
                    let previous_display_time = self.scheduler.record_display(&message.id);
                    tracing::info!(
                        target: "inapp_engine::lanes::mutation::process_pending",
                        "Showing message {}",
                        message.id
                    );
                    let command = UiCommand {
                        consume: !message.save_to_inbox,
                        message,
                        origin: ShowOrigin::Auto {
                            previous_display_time,
                        },
                        callback: None,
                        reply: None,
                    };
                    if self.senders.ui.send(command).is_err() {
                        tracing::warn!(
                            target: "inapp_engine::lanes::mutation::process_pending",
                            "UI lane is gone, cannot show message"
                        );
                    }
                    return;
                }
                ProcessorResult::NoShow(Some(consumed)) => {
                    tracing::debug!(
                        target: "inapp_engine::lanes::mutation::process_pending",
                        "Consumed json-only message {}",
                        consumed.id
                    );
                    report_consume(
                        self.context.collaborators.reporter.clone(),
                        consumed.id.clone(),
                        in_app_consume_context(&consumed),
                    );
                }
                ProcessorResult::NoShow(None) => {
                    self.schedule_retry_if_waiting();
                    return;
                }
            }
        }
    }

    /// After a deferred pass, wake up again once the display gate opens.
    fn schedule_retry_if_waiting(&mut self) {
        if self.scheduler.is_paused() {
            return;
        }
        if !self.messages.values().any(Message::is_processable_trigger) {
            return;
        }
        self.schedule_after(self.scheduler.next_wait());
    }

    /// Called after a dismissal: the next candidate gets its turn once the
    /// dismissal gap has passed.
    fn schedule_next(&mut self) {
        let wait = self.scheduler.next_wait();
        if wait.is_zero() {
            let _ = self.senders.mutation.send(MutationCommand::ProcessPending);
        } else {
            self.schedule_after(wait);
        }
    }

    fn schedule_after(&mut self, wait: std::time::Duration) {
        if wait.is_zero() {
            return;
        }
        let until = self.scheduler.now()
            + TimeDelta::from_std(wait).unwrap_or(TimeDelta::zero());
        self.scheduler.set_waiting(until);
        tracing::debug!(
            target: "inapp_engine::lanes::mutation::schedule_after",
            "Next check in {:?}",
            wait
        );
        if self.senders.schedule.send(Instant::now() + wait).is_err() {
            tracing::warn!(
                target: "inapp_engine::lanes::mutation::schedule_after",
                "Scheduling lane is gone"
            );
        }
    }

    async fn update(&mut self, message_id: &str, change: MessageChange) -> Option<Message> {
        let message = self.messages.get_mut(message_id)?;
        match change {
            MessageChange::Read(read) => message.read = read,
        }
        let updated = message.clone();
        self.commit().await;
        self.context.notifier.emit();
        Some(updated)
    }

    async fn remove(
        &mut self,
        message_id: &str,
        location: InAppLocation,
        source: Option<InAppDeleteSource>,
        inbox_session_id: Option<String>,
    ) -> Result<()> {
        let Some(message) = self.messages.get_mut(message_id) else {
            return Err(InAppError::MessageNotFound(message_id.to_string()));
        };
        message.consumed = true;
        message.did_process_trigger = true;
        let context = ConsumeContext {
            location,
            source,
            inbox_session_id,
            save_to_inbox: message.save_to_inbox,
        };

        self.commit().await;
        report_consume(
            self.context.collaborators.reporter.clone(),
            message_id.to_string(),
            context,
        );
        self.context.notifier.emit();
        Ok(())
    }

    async fn server_removed(&mut self, message_id: &str) -> bool {
        if self.messages.shift_remove(message_id).is_none() {
            return false;
        }
        self.commit().await;
        self.context.notifier.emit();
        true
    }

    async fn reset(&mut self) -> Result<()> {
        self.messages.clear();
        self.publish();
        let result = self.persister.clear().await.map_err(InAppError::from);
        self.context.notifier.emit();
        result
    }

    async fn display_started(&mut self, message_id: &str, consume: bool) {
        self.scheduler.set_displaying(message_id);
        let Some(message) = self.messages.get_mut(message_id) else {
            tracing::warn!(
                target: "inapp_engine::lanes::mutation::display_started",
                "Displayed message {} is no longer in the map",
                message_id
            );
            return;
        };
        message.read = true;
        message.did_process_trigger = true;
        message.consumed = consume;
        self.commit().await;
        self.context.notifier.emit();
    }

    /// Rolls back the tentative transition made when the processor picked the
    /// message, so it stays queued.
    async fn display_rejected(
        &mut self,
        message_id: &str,
        previous_display_time: Option<DateTime<Utc>>,
    ) {
        self.scheduler
            .rollback_display(message_id, previous_display_time);
        if let Some(message) = self.messages.get_mut(message_id) {
            message.did_process_trigger = false;
            message.consumed = false;
            self.commit().await;
        }
    }

    fn publish(&self) {
        self.snapshot_tx
            .send_replace(Arc::new(self.messages.clone()));
    }

    fn publish_phase(&self) {
        let phase = self.scheduler.phase().clone();
        self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }

    /// Publishes the new snapshot, then persists it.
    async fn commit(&mut self) {
        self.publish();
        let messages: Vec<Message> = self.messages.values().cloned().collect();
        if let Err(e) = self.persister.save(&messages).await {
            tracing::error!(
                target: "inapp_engine::lanes::mutation::commit",
                "Failed to persist messages: {}",
                e
            );
        }
    }
}
