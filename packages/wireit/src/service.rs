//! Long-running service supervision.
//!
//! Each service script gets a record that advances through a state machine:
//!
//! ```text
//! INITIAL -> FINGERPRINTING -> UNSTARTED -> STARTING -> STARTED
//!                                             |            |
//!                                             v            v
//!                                           FAILED   (DETACHED | STOPPING)
//!                                                             |
//!                                                             v
//!                                                    (STOPPED | FAILED)
//! ```
//!
//! `start` is idempotent: concurrent and repeated calls never double-spawn;
//! the supervisor owns the single child-process handle. A service stops when
//! its last active consumer releases it (unless directly invoked, in which
//! case it persists until abort), and a service that exits unexpectedly
//! transitions to FAILED so every dependent can fail with `dep-service-exit`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use color_eyre::{Result, eyre::Context};
use futures::future::{BoxFuture, FutureExt};
use regex::Regex;
use strum::Display;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    event::{EventSender, FailureReason, InfoDetail, OutputStream},
    script::{Execution, ReadyWhen, ScriptConfig, ScriptRef},
    spawn,
};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Initial,
    Fingerprinting,
    Unstarted,
    Starting,
    Started,
    /// Still running, but its executor has finished: a directly-invoked
    /// service waiting for abort.
    Detached,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Failed)
    }

    fn is_running(self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::Started | ServiceState::Detached
        )
    }
}

/// The outcome of a start request.
#[derive(Clone, Debug)]
pub enum StartResult {
    Ready,
    Failed(String),
}

/// One service's supervised record.
pub struct ServiceRecord {
    config: Arc<ScriptConfig>,
    state: watch::Sender<ServiceState>,
    /// Serializes the UNSTARTED -> STARTING transition.
    start_lock: Mutex<()>,
    /// Dependents currently executing.
    consumers: StdMutex<usize>,
    /// Signal asking the driver task to shut the child down.
    stop: watch::Sender<bool>,
}

impl ServiceRecord {
    fn new(config: Arc<ScriptConfig>, consumers: usize) -> Self {
        let (state, _) = watch::channel(ServiceState::Initial);
        let (stop, _) = watch::channel(false);
        Self {
            config,
            state,
            start_lock: Mutex::new(()),
            consumers: StdMutex::new(consumers),
            stop,
        }
    }

    pub fn script(&self) -> &ScriptRef {
        &self.config.script
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ServiceState) {
        debug!(script = %self.config.script, ?next, "service transition");
        self.state.send_replace(next);
    }

    /// Wait until the service reaches STARTED (or better), or fails.
    pub async fn wait_started(&self) -> StartResult {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ServiceState::Started | ServiceState::Detached => return StartResult::Ready,
                ServiceState::Failed => {
                    return StartResult::Failed("service failed to start".into());
                }
                ServiceState::Stopped | ServiceState::Stopping => {
                    return StartResult::Failed("service stopped before becoming ready".into());
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return StartResult::Failed("service record dropped".into());
            }
        }
    }

    /// Wait until the service reaches a terminal state.
    pub async fn wait_terminated(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if rx.borrow_and_update().is_terminal() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolve if this service fails; pends forever otherwise.
    pub async fn wait_failed(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow_and_update() == ServiceState::Failed {
                return;
            }
            if rx.changed().await.is_err() {
                return futures::future::pending::<()>().await;
            }
        }
    }
}

/// Supervisor owning every service record for one engine invocation.
#[derive(Clone)]
pub struct ServiceSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    events: EventSender,
    cancel: CancellationToken,
    grace: Duration,
    services: StdMutex<HashMap<ScriptRef, Arc<ServiceRecord>>>,
    /// Consumer counts computed from the graph before execution begins, so
    /// an early finisher can never stop a service a later consumer still
    /// needs.
    expected: StdMutex<HashMap<ScriptRef, usize>>,
}

impl ServiceSupervisor {
    pub fn new(events: EventSender, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                events,
                cancel,
                grace: spawn::GRACE_PERIOD,
                services: StdMutex::new(HashMap::new()),
                expected: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Declare, before execution begins, how many dependents will
    /// eventually release each service. Records created by `register` start
    /// from these counts.
    pub fn expect_consumers(&self, counts: impl IntoIterator<Item = (ScriptRef, usize)>) {
        let mut expected = self.inner.expected.lock().expect("expected lock");
        for (script, count) in counts {
            *expected.entry(script).or_default() += count;
        }
    }

    /// Create (or fetch) the record for a service script.
    pub fn register(&self, config: Arc<ScriptConfig>) -> Arc<ServiceRecord> {
        debug_assert!(config.is_service());
        let consumers = self
            .inner
            .expected
            .lock()
            .expect("expected lock")
            .get(&config.script)
            .copied()
            .unwrap_or(0);
        let mut services = self.inner.services.lock().expect("supervisor lock");
        services
            .entry(config.script.clone())
            .or_insert_with(|| Arc::new(ServiceRecord::new(config, consumers)))
            .clone()
    }

    pub fn get(&self, script: &ScriptRef) -> Option<Arc<ServiceRecord>> {
        self.inner
            .services
            .lock()
            .expect("supervisor lock")
            .get(script)
            .cloned()
    }

    /// Mark the record as computing its fingerprint (`execute` dispatch).
    pub fn mark_fingerprinting(&self, record: &ServiceRecord) {
        if record.state() == ServiceState::Initial {
            record.set_state(ServiceState::Fingerprinting);
        }
    }

    /// Fingerprint complete; the service may now be started.
    pub fn mark_unstarted(&self, record: &ServiceRecord) {
        if record.state() == ServiceState::Fingerprinting {
            record.set_state(ServiceState::Unstarted);
        }
    }

    /// A dependency failed during `execute`; the service can never start.
    pub fn mark_failed(&self, record: &ServiceRecord) {
        if !record.state().is_terminal() {
            record.set_state(ServiceState::Failed);
        }
    }

    /// A dependent finished. When the count reaches zero and the service is
    /// not directly invoked, it shuts down.
    pub fn release_consumer(&self, script: &ScriptRef) {
        let Some(record) = self.get(script) else {
            return;
        };
        let remaining = {
            let mut consumers = record.consumers.lock().expect("consumer lock");
            *consumers = consumers.saturating_sub(1);
            *consumers
        };
        if remaining == 0 && !record.config.directly_invoked {
            self.request_stop(&record);
        }
    }

    /// The executor finished while a directly-invoked service is running;
    /// it persists until abort.
    pub fn detach(&self, script: &ScriptRef) {
        if let Some(record) = self.get(script)
            && record.state() == ServiceState::Started
        {
            record.set_state(ServiceState::Detached);
        }
    }

    fn request_stop(&self, record: &ServiceRecord) {
        if record.state().is_running() {
            record.set_state(ServiceState::Stopping);
            record.stop.send_replace(true);
        } else if !record.state().is_terminal() {
            // Never spawned; nothing to wait for.
            record.set_state(ServiceState::Stopped);
        }
    }

    /// Ask every service to stop and wait for them to reach terminal
    /// states. Used at abort and at the end of an invocation.
    #[instrument(skip(self))]
    pub async fn shutdown_all(&self) {
        let records: Vec<Arc<ServiceRecord>> = self
            .inner
            .services
            .lock()
            .expect("supervisor lock")
            .values()
            .cloned()
            .collect();
        for record in &records {
            self.request_stop(record);
        }
        for record in &records {
            record.wait_terminated().await;
        }
    }

    /// Idempotently start a service, waiting until it is ready.
    ///
    /// The service's own effective service dependencies are started first;
    /// the service holds a consumer on each of them until it terminates.
    pub fn start(&self, script: &ScriptRef) -> BoxFuture<'_, Result<StartResult>> {
        let script = script.clone();
        async move {
            let Some(record) = self.get(&script) else {
                return Ok(StartResult::Failed(format!(
                    "service {script} was never analyzed"
                )));
            };

            // Fast paths that never need the start lock.
            match record.state() {
                ServiceState::Started | ServiceState::Detached => return Ok(StartResult::Ready),
                ServiceState::Failed => {
                    return Ok(StartResult::Failed("service already failed".into()));
                }
                ServiceState::Stopped | ServiceState::Stopping => {
                    return Ok(StartResult::Failed("service already stopped".into()));
                }
                _ => {}
            }

            let guard = record.start_lock.lock().await;
            match record.state() {
                ServiceState::Unstarted => {}
                ServiceState::Starting | ServiceState::Started | ServiceState::Detached => {
                    drop(guard);
                    return Ok(record.wait_started().await);
                }
                ServiceState::Initial | ServiceState::Fingerprinting => {
                    return Ok(StartResult::Failed(
                        "service was started before it was executed".into(),
                    ));
                }
                ServiceState::Stopping | ServiceState::Stopped => {
                    return Ok(StartResult::Failed("service already stopped".into()));
                }
                ServiceState::Failed => {
                    return Ok(StartResult::Failed("service already failed".into()));
                }
            }

            // Start child services first; invariant: a service is STARTED
            // before any consumer's command spawns, and a service consumes
            // its own service dependencies while it runs.
            for dep in &record.config.service_deps {
                match self.start(dep).await? {
                    StartResult::Ready => {}
                    StartResult::Failed(message) => {
                        record.set_state(ServiceState::Failed);
                        return Ok(StartResult::Failed(format!(
                            "service dependency {dep} failed: {message}"
                        )));
                    }
                }
            }

            record.set_state(ServiceState::Starting);
            if let Some(failed) = self.spawn_service(&record).await? {
                return Ok(failed);
            }
            drop(guard);

            Ok(record.wait_started().await)
        }
        .boxed()
    }

    /// Spawn the child and wire up readiness, output, and exit handling.
    async fn spawn_service(&self, record: &Arc<ServiceRecord>) -> Result<Option<StartResult>> {
        let config = &record.config;
        let Execution::Service {
            command,
            ready_when,
        } = &config.execution
        else {
            unreachable!("registered records are services");
        };

        self.inner.events.info(
            &config.script,
            InfoDetail::Running {
                command: command.clone(),
            },
        );

        let mut cmd = spawn::build_command(
            config.package(),
            command,
            config.extra_args.as_deref(),
        );
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                record.set_state(ServiceState::Failed);
                self.inner.events.failure(
                    &config.script,
                    FailureReason::SpawnError,
                    format!("failed to spawn service: {err}"),
                );
                return Ok(Some(StartResult::Failed(err.to_string())));
            }
        };

        // Readiness: either the spawn itself, or the first output line
        // matching the configured pattern.
        let monitor = match ready_when {
            ReadyWhen::Spawn => None,
            ReadyWhen::LineMatches(pattern) => {
                let regex = Regex::new(pattern).context("readiness pattern was validated")?;
                Some(Arc::new(StdMutex::new(LineMonitor::new(regex))))
            }
        };

        type OutputReader = Box<dyn tokio::io::AsyncRead + Unpin + Send>;
        let stdout = child.stdout.take().map(|r| Box::new(r) as OutputReader);
        let stderr = child.stderr.take().map(|r| Box::new(r) as OutputReader);
        for (stream, reader) in [(OutputStream::Stdout, stdout), (OutputStream::Stderr, stderr)] {
            let Some(reader) = reader else { continue };
            let record = record.clone();
            let events = self.inner.events.clone();
            let monitor = monitor.clone();
            tokio::spawn(async move {
                let script = record.config.script.clone();
                let result = spawn::read_chunks(reader, |chunk| {
                    if let Some(monitor) = &monitor {
                        let matched = monitor.lock().expect("monitor lock").feed(&chunk);
                        if matched && record.state() == ServiceState::Starting {
                            record.set_state(ServiceState::Started);
                            events.info(&script, InfoDetail::ServiceStarted);
                        }
                    }
                    events.output(&script, stream, chunk);
                })
                .await;
                if let Err(err) = result {
                    warn!(%script, ?err, "service output stream closed abnormally");
                }
            });
        }

        if matches!(ready_when, ReadyWhen::Spawn) {
            record.set_state(ServiceState::Started);
            self.inner
                .events
                .info(&config.script, InfoDetail::ServiceStarted);
        }

        // Driver task: owns the child handle for the rest of its life.
        let supervisor = self.clone();
        let record = record.clone();
        tokio::spawn(async move {
            supervisor.drive(record, child).await;
        });

        Ok(None)
    }

    /// Own the child until it exits, shutting it down on request or abort.
    async fn drive(&self, record: Arc<ServiceRecord>, mut child: tokio::process::Child) {
        let script = record.config.script.clone();
        let mut stop_rx = record.stop.subscribe();
        let outcome = tokio::select! {
            status = child.wait() => Some(status),
            _ = stop_rx.wait_for(|requested| *requested) => None,
            _ = self.inner.cancel.cancelled() => None,
        };

        match outcome {
            // The child exited on its own. Services are expected not to.
            Some(status) => {
                let message = match status {
                    Ok(status) => format!("service exited unexpectedly with {status}"),
                    Err(err) => format!("service exited unexpectedly: {err}"),
                };
                let was_stopping = record.state() == ServiceState::Stopping;
                if was_stopping {
                    record.set_state(ServiceState::Stopped);
                    self.inner.events.info(&script, InfoDetail::ServiceStopped);
                } else {
                    record.set_state(ServiceState::Failed);
                    self.inner
                        .events
                        .failure(&script, FailureReason::DepServiceExit, message);
                }
            }
            // Asked to stop: polite, then forceful.
            None => {
                if record.state().is_running() {
                    record.set_state(ServiceState::Stopping);
                }
                if let Err(err) = spawn::terminate(&mut child, self.inner.grace).await {
                    warn!(%script, ?err, "error terminating service");
                }
                record.set_state(ServiceState::Stopped);
                self.inner.events.info(&script, InfoDetail::ServiceStopped);
            }
        }

        // Whatever happened, release the service's holds on its own
        // service dependencies.
        for dep in &record.config.service_deps {
            self.release_consumer(dep);
        }
    }
}

/// Buffers partial output and reports when a complete line matches the
/// readiness pattern.
pub struct LineMonitor {
    pattern: Regex,
    buffer: Vec<u8>,
    matched: bool,
}

impl LineMonitor {
    pub fn new(pattern: Regex) -> Self {
        Self {
            pattern,
            buffer: Vec::new(),
            matched: false,
        }
    }

    /// Feed a chunk; returns true once any complete line has matched.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.matched {
            return true;
        }
        self.buffer.extend_from_slice(chunk);
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if self.pattern.is_match(line.trim_end_matches(['\n', '\r'])) {
                self.matched = true;
                return true;
            }
        }
        false
    }
}
