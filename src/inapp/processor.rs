//! Candidate selection for automatic display.

use crate::inapp::collaborators::{InAppDelegate, InAppResponse};
use crate::inapp::message::{Message, MessageMap};

/// Display gate consulted before the delegate sees a candidate.
pub trait DisplayChecker {
    fn is_ok_to_show_now(&self, message: &Message) -> bool;
}

impl<F> DisplayChecker for F
where
    F: Fn(&Message) -> bool,
{
    fn is_ok_to_show_now(&self, message: &Message) -> bool {
        self(message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorResult {
    /// Display this message.
    Show(Message),
    /// Nothing to display. Carries a json-only message that was consumed
    /// during this pass so its consumption can be reported.
    NoShow(Option<Message>),
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub result: ProcessorResult,
    /// The map with every processing flag set during this pass.
    pub messages: MessageMap,
}

/// Runs one selection pass over a copy of the canonical map.
pub struct MessagesProcessor<'a> {
    delegate: &'a dyn InAppDelegate,
    checker: &'a dyn DisplayChecker,
    messages: MessageMap,
}

impl<'a> MessagesProcessor<'a> {
    pub fn new(
        delegate: &'a dyn InAppDelegate,
        checker: &'a dyn DisplayChecker,
        messages: MessageMap,
    ) -> Self {
        Self {
            delegate,
            checker,
            messages,
        }
    }

    pub fn process(mut self) -> ProcessOutcome {
        let result = self.select();
        ProcessOutcome {
            result,
            messages: self.messages,
        }
    }

    fn select(&mut self) -> ProcessorResult {
        loop {
            let Some(id) = self.next_candidate_id() else {
                return ProcessorResult::NoShow(None);
            };
            let Some(candidate) = self.messages.get(&id) else {
                return ProcessorResult::NoShow(None);
            };

            if !self.checker.is_ok_to_show_now(candidate) {
                tracing::debug!(
                    target: "inapp_engine::processor::select",
                    "Not ok to show {} now, deferring",
                    id
                );
                return ProcessorResult::NoShow(None);
            }

            let response = self.delegate.on_new_message(candidate);

            let Some(message) = self.messages.get_mut(&id) else {
                return ProcessorResult::NoShow(None);
            };
            message.did_process_trigger = true;

            if message.json_only {
                message.consumed = true;
                return ProcessorResult::NoShow(Some(message.clone()));
            }

            match response {
                InAppResponse::Skip => {
                    tracing::debug!(
                        target: "inapp_engine::processor::select",
                        "Delegate skipped {}",
                        id
                    );
                }
                InAppResponse::Show => {
                    message.consumed = !message.save_to_inbox;
                    return ProcessorResult::Show(message.clone());
                }
            }
        }
    }

    /// Lowest priority level wins; ties go to the earliest entry in map order.
    fn next_candidate_id(&self) -> Option<String> {
        self.messages
            .values()
            .filter(|message| message.is_processable_trigger())
            .min_by(|a, b| a.priority_level.total_cmp(&b.priority_level))
            .map(|message| message.id.clone())
    }
}
