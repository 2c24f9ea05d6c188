//! Display throttling.
//!
//! The scheduler owns the two timestamps that gate automatic display and the
//! observable phase of the display cycle. It lives inside the mutation lane;
//! the scheduling lane only turns deadlines into `ProcessPending` commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::inapp::collaborators::Clock;
use crate::inapp::message::Message;
use crate::inapp::processor::DisplayChecker;

/// Added to every gap so a re-check scheduled exactly at the boundary does
/// not land a hair too early.
pub const DISPLAY_GUARD: Duration = Duration::from_millis(100);

/// Time left until `gap` (plus [`DISPLAY_GUARD`]) has elapsed since `from`.
/// Zero when `from` is unset or the gap has already passed.
pub fn wait_time(from: Option<DateTime<Utc>>, now: DateTime<Utc>, gap: Duration) -> Duration {
    let Some(from) = from else {
        return Duration::ZERO;
    };
    // A timestamp in the future counts as "just now".
    let elapsed = (now - from).to_std().unwrap_or(Duration::ZERO);
    (gap + DISPLAY_GUARD).saturating_sub(elapsed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    /// A re-check is scheduled for `until`.
    Waiting { until: DateTime<Utc> },
    /// A message is on screen.
    Displaying { message_id: String },
}

impl SchedulerPhase {
    pub fn is_displaying(&self) -> bool {
        matches!(self, SchedulerPhase::Displaying { .. })
    }
}

pub struct DisplayScheduler {
    display_interval: Duration,
    last_display_time: Option<DateTime<Utc>>,
    last_dismissed_time: Option<DateTime<Utc>>,
    paused: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    phase: SchedulerPhase,
}

impl DisplayScheduler {
    pub fn new(display_interval: Duration, paused: Arc<AtomicBool>, clock: Arc<dyn Clock>) -> Self {
        Self {
            display_interval,
            last_display_time: None,
            last_dismissed_time: None,
            paused,
            clock,
            phase: SchedulerPhase::Idle,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn display_wait(&self) -> Duration {
        wait_time(self.last_display_time, self.now(), self.display_interval)
    }

    pub fn dismissal_wait(&self) -> Duration {
        wait_time(self.last_dismissed_time, self.now(), self.display_interval)
    }

    /// How long until both gaps have passed.
    pub fn next_wait(&self) -> Duration {
        self.display_wait().max(self.dismissal_wait())
    }

    pub fn last_display_time(&self) -> Option<DateTime<Utc>> {
        self.last_display_time
    }

    pub fn last_dismissed_time(&self) -> Option<DateTime<Utc>> {
        self.last_dismissed_time
    }

    pub fn phase(&self) -> &SchedulerPhase {
        &self.phase
    }

    /// Records that `message_id` was selected for display and returns the
    /// previous display time so a rejected display can be rolled back.
    pub fn record_display(&mut self, message_id: &str) -> Option<DateTime<Utc>> {
        let previous = self.last_display_time.replace(self.now());
        self.set_displaying(message_id);
        previous
    }

    /// Enters `Displaying` without touching the display time, for messages
    /// the host shows explicitly.
    pub fn set_displaying(&mut self, message_id: &str) {
        self.phase = SchedulerPhase::Displaying {
            message_id: message_id.to_string(),
        };
    }

    /// Undoes [`record_display`](Self::record_display) after the displayer
    /// declined `message_id`. The phase is left alone if another message has
    /// taken the screen in the meantime.
    pub fn rollback_display(&mut self, message_id: &str, previous: Option<DateTime<Utc>>) {
        self.last_display_time = previous;
        if matches!(
            &self.phase,
            SchedulerPhase::Displaying { message_id: shown } if shown == message_id
        ) {
            self.phase = SchedulerPhase::Idle;
        }
    }

    pub fn record_dismissal(&mut self) {
        self.last_dismissed_time = Some(self.now());
        self.phase = SchedulerPhase::Idle;
    }

    pub fn set_waiting(&mut self, until: DateTime<Utc>) {
        self.phase = SchedulerPhase::Waiting { until };
    }

    /// Leaves `Waiting`; a displaying phase is only ended by dismissal or
    /// rollback.
    pub fn clear_waiting(&mut self) {
        if matches!(self.phase, SchedulerPhase::Waiting { .. }) {
            self.phase = SchedulerPhase::Idle;
        }
    }
}

impl DisplayChecker for DisplayScheduler {
    fn is_ok_to_show_now(&self, message: &Message) -> bool {
        if self.is_paused() {
            tracing::debug!(
                target: "inapp_engine::scheduler::is_ok_to_show_now",
                "Automatic display is paused"
            );
            return false;
        }
        if message.did_process_trigger {
            tracing::debug!(
                target: "inapp_engine::scheduler::is_ok_to_show_now",
                "Message {} already processed",
                message.id
            );
            return false;
        }
        let dismissal_wait = self.dismissal_wait();
        if !dismissal_wait.is_zero() {
            tracing::debug!(
                target: "inapp_engine::scheduler::is_ok_to_show_now",
                "Too soon after dismissal, {:?} left",
                dismissal_wait
            );
            return false;
        }
        let display_wait = self.display_wait();
        if !display_wait.is_zero() {
            tracing::debug!(
                target: "inapp_engine::scheduler::is_ok_to_show_now",
                "Too soon after last display, {:?} left",
                display_wait
            );
            return false;
        }
        true
    }
}

impl std::fmt::Debug for DisplayScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayScheduler")
            .field("display_interval", &self.display_interval)
            .field("last_display_time", &self.last_display_time)
            .field("last_dismissed_time", &self.last_dismissed_time)
            .field("paused", &self.is_paused())
            .field("phase", &self.phase)
            .finish()
    }
}
