//! Typed event stream emitted by the engine.
//!
//! The executor, service supervisor, cache, and watcher all emit events onto
//! a single unbounded channel; subscribers (the console logger, metrics)
//! consume read-only. User-visible script output travels here too, never
//! through `tracing`.

use std::path::PathBuf;

use strum::Display;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{diagnostic::Diagnostic, script::ScriptRef};

/// Which child stream a chunk of output came from.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
#[strum(serialize_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Why a script succeeded without or with running.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SuccessReason {
    /// The script has no command; it only groups dependencies.
    NoCommand,
    /// Nothing changed since the previous successful run.
    Fresh,
    /// Output was restored from the cache.
    Cached,
    /// The command ran and exited zero.
    ExitZero,
}

/// Why a script failed.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FailureReason {
    SpawnError,
    Signal,
    ExitNonZero,
    DepFailed,
    DepServiceExit,
    StartCancelled,
    Cycle,
    InvalidConfig,
    NoScriptsToRun,
    Locked,
    FailedPreviousWatchIteration,
}

/// Informational details that are not successes or failures.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum InfoDetail {
    /// The script's command is about to spawn.
    Running { command: String },
    /// Another invocation holds the advisory lock; this one is waiting.
    Locked { lock: PathBuf },
    /// A service reached its readiness condition.
    ServiceStarted,
    /// A service was shut down after its last consumer finished.
    ServiceStopped,
    /// A watch iteration is beginning.
    WatchRun { iteration: u64 },
    /// The cache declined to store this entry.
    CacheStoreSkipped,
}

#[derive(Clone, Debug)]
pub enum Event {
    Info {
        script: ScriptRef,
        detail: InfoDetail,
    },
    Output {
        script: ScriptRef,
        stream: OutputStream,
        chunk: Vec<u8>,
    },
    Success {
        script: ScriptRef,
        reason: SuccessReason,
    },
    Failure {
        script: ScriptRef,
        reason: FailureReason,
        message: String,
        diagnostic: Option<Diagnostic>,
    },
    /// A bug: an error outside the known failure taxonomy. The process
    /// reports it with the bug exit code.
    UnexpectedError {
        script: ScriptRef,
        message: String,
    },
}

impl Event {
    pub fn script(&self) -> &ScriptRef {
        match self {
            Event::Info { script, .. }
            | Event::Output { script, .. }
            | Event::Success { script, .. }
            | Event::Failure { script, .. }
            | Event::UnexpectedError { script, .. } => script,
        }
    }
}

/// Sending half of the event bus. Cheap to clone.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create a connected event bus.
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

impl EventSender {
    /// Emit an event. Subscribers having gone away is not an error: the
    /// engine's behavior must not depend on anyone listening.
    pub fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            trace!("event dropped: no subscriber");
        }
    }

    pub fn info(&self, script: &ScriptRef, detail: InfoDetail) {
        self.emit(Event::Info {
            script: script.clone(),
            detail,
        });
    }

    pub fn output(&self, script: &ScriptRef, stream: OutputStream, chunk: Vec<u8>) {
        self.emit(Event::Output {
            script: script.clone(),
            stream,
            chunk,
        });
    }

    pub fn success(&self, script: &ScriptRef, reason: SuccessReason) {
        self.emit(Event::Success {
            script: script.clone(),
            reason,
        });
    }

    pub fn failure(&self, script: &ScriptRef, reason: FailureReason, message: impl Into<String>) {
        self.emit(Event::Failure {
            script: script.clone(),
            reason,
            message: message.into(),
            diagnostic: None,
        });
    }

    pub fn failure_diagnostic(
        &self,
        script: &ScriptRef,
        reason: FailureReason,
        diagnostic: Diagnostic,
    ) {
        self.emit(Event::Failure {
            script: script.clone(),
            reason,
            message: diagnostic.message.clone(),
            diagnostic: Some(diagnostic),
        });
    }
}
