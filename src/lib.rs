use std::sync::{Mutex, OnceLock};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

pub mod inapp;

pub use crate::inapp::collaborators::{
    ActionHandler, ApplicationStateProvider, Clock, Collaborators, ConsumeContext, DisplayOutcome,
    Displayer, Fetcher, InAppDelegate, InAppDeleteSource, InAppLocation, InAppResponse,
    InboxSession, Reporter, ShowResult, SystemClock, UrlCallback,
};
pub use crate::inapp::error::{CollaboratorError, InAppError, ParseError, PersistenceError, Result};
pub use crate::inapp::message::{Message, MessageContent, Trigger, TriggerType};
pub use crate::inapp::notifications::InboxChanged;
pub use crate::inapp::persistence::{FilePersister, InMemoryPersister, Persister, SqlitePersister};
pub use crate::inapp::scheduler::SchedulerPhase;
pub use crate::inapp::{InAppConfig, InAppManager};

static TRACING_GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber once per process: stdout plus a daily
/// rolling file in `logs_dir`. The filter comes from `RUST_LOG`, defaulting
/// to `info`.
pub fn init_tracing(logs_dir: &std::path::Path) {
    TRACING_INIT.get_or_init(|| {
        let mut guards = Vec::with_capacity(2);

        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(stdout_guard);
        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("inapp_engine")
            .filename_suffix("log")
            .build(logs_dir);
        let file_layer = match file_appender {
            Ok(file_appender) => {
                let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
                guards.push(file_guard);
                Some(
                    Layer::new()
                        .with_writer(non_blocking_file)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!("Failed to create log file appender in {logs_dir:?}: {e}");
                None
            }
        };

        TRACING_GUARDS.set(Mutex::new(guards)).ok();

        let result = Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .try_init();
        if let Err(e) = result {
            eprintln!("Tracing was already initialized: {e}");
        }
    });
}
