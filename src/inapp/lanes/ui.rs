use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{
    in_app_consume_context, report_consume, LaneContext, LaneSenders, MutationCommand, ShowOrigin,
    UiCommand,
};
use crate::inapp::actions::{dispatch_click, ClickEffect};
use crate::inapp::collaborators::{
    DisplayOutcome, Displayer, InAppDeleteSource, InAppLocation, ShowResult, UrlCallback,
};
use crate::inapp::error::{InAppError, Result};
use crate::inapp::message::Message;

tokio::task_local! {
    static UI_LANE: ();
}

fn on_ui_lane() -> bool {
    UI_LANE.try_with(|_| ()).is_ok()
}

/// Hands `message` to the displayer. Fails with [`InAppError::NotOnUiLane`]
/// anywhere but the UI lane.
async fn present(displayer: &dyn Displayer, message: &Message) -> Result<ShowResult> {
    if !on_ui_lane() {
        return Err(InAppError::NotOnUiLane);
    }
    Ok(displayer.show(message).await)
}

pub(super) fn spawn(
    context: LaneContext,
    senders: LaneSenders,
    receiver: mpsc::UnboundedReceiver<UiCommand>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(UI_LANE.scope((), run(context, senders, receiver, shutdown)))
}

async fn run(
    context: LaneContext,
    senders: LaneSenders,
    mut receiver: mpsc::UnboundedReceiver<UiCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            Some(command) = receiver.recv() => {
                show(&context, &senders, command).await;
            }
            _ = shutdown.changed() => {
                tracing::debug!(
                    target: "inapp_engine::lanes::ui::run",
                    "Received shutdown signal, finishing current queue..."
                );
                while let Ok(command) = receiver.try_recv() {
                    show(&context, &senders, command).await;
                }
                break;
            }
        }
    }
}

async fn show(context: &LaneContext, senders: &LaneSenders, command: UiCommand) {
    let UiCommand {
        message,
        consume,
        origin,
        callback,
        reply,
    } = command;

    let result = if message.json_only {
        Err(InAppError::DisplayRejected(
            "json-only messages are never displayed".to_string(),
        ))
    } else {
        present(context.collaborators.displayer.as_ref(), &message).await
    };

    let outcome = match result {
        Ok(ShowResult::Shown(outcome)) => outcome,
        Ok(ShowResult::NotShown(reason)) => {
            tracing::warn!(
                target: "inapp_engine::lanes::ui::show",
                "Could not show message {}: {}",
                message.id,
                reason
            );
            reject(senders, &message, origin);
            if let Some(reply) = reply {
                let _ = reply.send(Err(InAppError::DisplayRejected(reason)));
            }
            return;
        }
        Err(e) => {
            reject(senders, &message, origin);
            if let Some(reply) = reply {
                let _ = reply.send(Err(e));
            }
            return;
        }
    };

    tracing::debug!(
        target: "inapp_engine::lanes::ui::show",
        "Message {} shown",
        message.id
    );
    // The host hears back once the new state is committed.
    let _ = senders.mutation.send(MutationCommand::DisplayStarted {
        message_id: message.id.clone(),
        consume,
        reply,
    });

    // The lane must stay free while the user looks at the message.
    tokio::spawn(watch_outcome(
        context.clone(),
        senders.mutation.clone(),
        message,
        consume,
        callback,
        outcome,
    ));
}

fn reject(senders: &LaneSenders, message: &Message, origin: ShowOrigin) {
    if let ShowOrigin::Auto {
        previous_display_time,
    } = origin
    {
        let _ = senders.mutation.send(MutationCommand::DisplayRejected {
            message_id: message.id.clone(),
            previous_display_time,
        });
    }
}

async fn watch_outcome(
    context: LaneContext,
    mutation: mpsc::UnboundedSender<MutationCommand>,
    message: Message,
    consume: bool,
    callback: Option<UrlCallback>,
    outcome: oneshot::Receiver<DisplayOutcome>,
) {
    // A displayer that drops the sender has dismissed the message.
    let outcome = outcome.await.unwrap_or(DisplayOutcome::Dismissed);

    let mut effect = ClickEffect::None;
    if let DisplayOutcome::Clicked(url) = &outcome {
        tracing::debug!(
            target: "inapp_engine::lanes::ui::watch_outcome",
            "Message {} clicked: {}",
            message.id,
            url
        );
        if let Some(callback) = callback {
            callback(url.as_str());
        }
        effect = dispatch_click(
            context.collaborators.action_handler.as_ref(),
            &message,
            url,
            &context.config.allowed_protocols,
        )
        .await;
    }

    let _ = mutation.send(MutationCommand::Dismissed);

    if effect == ClickEffect::Delete {
        // Removal reports its own consumption.
        let _ = mutation.send(MutationCommand::Remove {
            message_id: message.id.clone(),
            location: InAppLocation::InApp,
            source: Some(InAppDeleteSource::DeleteButton),
            inbox_session_id: None,
            reply: None,
        });
    } else if consume {
        report_consume(
            context.collaborators.reporter.clone(),
            message.id.clone(),
            in_app_consume_context(&message),
        );
    }
}
