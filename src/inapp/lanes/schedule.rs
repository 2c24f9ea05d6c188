use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::MutationCommand;

/// Holds at most one deadline. A new request only moves it earlier; when it
/// fires the mutation lane re-runs selection and asks again if it still has
/// to wait.
pub(super) async fn run(
    mutation: mpsc::UnboundedSender<MutationCommand>,
    mut receiver: mpsc::UnboundedReceiver<Instant>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let sleep_until = deadline;
        tokio::select! {
            Some(requested) = receiver.recv() => {
                deadline = Some(match deadline {
                    Some(current) => current.min(requested),
                    None => requested,
                });
            }
            _ = tokio::time::sleep_until(sleep_until.unwrap_or_else(Instant::now)), if sleep_until.is_some() => {
                deadline = None;
                if mutation.send(MutationCommand::ProcessPending).is_err() {
                    tracing::debug!(
                        target: "inapp_engine::lanes::schedule::run",
                        "Mutation lane is gone, stopping"
                    );
                    break;
                }
            }
            _ = shutdown.changed() => {
                tracing::debug!(
                    target: "inapp_engine::lanes::schedule::run",
                    "Received shutdown signal, dropping pending deadline"
                );
                break;
            }
        }
    }
}
