//! DAG execution: run every script the root transitively needs, each at
//! most once, respecting dependencies, the concurrency limit, and the
//! failure policy.
//!
//! Execution is memoized per script ref as a shared future: however many
//! dependents request a script, its body runs once and every awaiter
//! observes the same settled result. Dependencies are dispatched in
//! parallel in a deliberately randomized order on every run, to shake out
//! accidental order dependence between scripts.
//!
//! Ordering guarantees kept here:
//! - dependencies complete before a dependent's command spawns;
//! - effective service dependencies reach STARTED before the spawn;
//! - output deletion completes before spawn and before cache restore;
//! - the cache write for a fingerprint completes before the persisted
//!   previous-fingerprint advances to it.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use color_eyre::{Result, eyre::{Context, OptionExt}};
use futures::future::{BoxFuture, FutureExt, Shared};
use itertools::Itertools;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    analyzer::ScriptGraph,
    cache::{Cache, CacheBackend, StoreOutcome},
    event::{Event, EventSender, FailureReason, InfoDetail, OutputStream, SuccessReason},
    fingerprint::Fingerprint,
    fs::{Fs, LockFile, LockedFile},
    glob::{self, EntryKind, GlobOptions},
    script::{Clean, Execution, ScriptConfig, ScriptRef},
    service::{ServiceRecord, ServiceSupervisor, StartResult},
    spawn,
    state::{Replay, StateStore},
};

/// How failures propagate across the graph.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum FailureMode {
    /// Running scripts continue; no new scripts start.
    #[default]
    NoNew,
    /// Running scripts continue; new scripts start unless one of their own
    /// transitive dependencies failed.
    Continue,
    /// Signal all running scripts immediately; start no new ones.
    Kill,
}

/// Bound on concurrently running commands.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Parallelism {
    Bounded(usize),
    Unbounded,
}

impl Default for Parallelism {
    fn default() -> Self {
        Parallelism::Bounded(num_cpus::get() * 4)
    }
}

/// Options injected into one executor invocation.
#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    pub failure_mode: FailureMode,
    pub parallelism: Parallelism,
    /// Scripts that failed in the previous watch iteration, with the
    /// fingerprint they failed at. An unchanged script from this set fails
    /// again without running.
    pub failed_previously: HashMap<ScriptRef, String>,
}

/// How one script's execution ended, when it didn't succeed.
#[derive(Clone, Debug)]
pub struct ExecFailure {
    pub script: ScriptRef,
    pub kind: FailureKind,
    pub message: String,
    /// Fingerprint at failure time, for watch-iteration bookkeeping.
    pub fingerprint: Option<String>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FailureKind {
    Known(FailureReason),
    /// A bug, reported with the bug exit code.
    Unexpected,
}

pub type ExecutionResult = std::result::Result<Arc<Fingerprint>, ExecFailure>;

type SharedExecution = Shared<BoxFuture<'static, ExecutionResult>>;

/// One invocation's executor. Cheap to clone.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    graph: ScriptGraph,
    fs: Fs,
    state: StateStore,
    cache: Option<Cache>,
    events: EventSender,
    services: ServiceSupervisor,
    options: ExecuteOptions,
    /// Bounds concurrently running commands. `None` means unbounded.
    spawn_permits: Option<Arc<Semaphore>>,
    /// External abort.
    cancel: CancellationToken,
    /// Failure-mode `kill`, derived from `cancel` so an abort also kills.
    kill: CancellationToken,
    any_failure: AtomicBool,
    executions: Mutex<HashMap<ScriptRef, SharedExecution>>,
    failures: std::sync::Mutex<Vec<ExecFailure>>,
}

impl Executor {
    pub fn new(
        graph: ScriptGraph,
        fs: Fs,
        cache: Option<Cache>,
        events: EventSender,
        services: ServiceSupervisor,
        options: ExecuteOptions,
        cancel: CancellationToken,
    ) -> Self {
        let spawn_permits = match options.parallelism {
            Parallelism::Bounded(limit) => Some(Arc::new(Semaphore::new(limit.max(1)))),
            Parallelism::Unbounded => None,
        };
        let kill = cancel.child_token();

        // Seed the supervisor with the graph's consumer counts: every
        // command-bearing script holds each of its effective service deps,
        // and every service holds its own service deps while it runs.
        services.expect_consumers(graph.scripts.values().flat_map(|config| {
            let consuming = matches!(config.execution, Execution::OneShot { .. })
                || config.is_service();
            config
                .service_deps
                .iter()
                .filter(move |_| consuming)
                .map(|service| (service.clone(), 1))
        }));

        Self {
            inner: Arc::new(Inner {
                graph,
                state: StateStore::new(fs.clone()),
                fs,
                cache,
                events,
                services,
                options,
                spawn_permits,
                cancel,
                kill,
                any_failure: AtomicBool::new(false),
                executions: Mutex::new(HashMap::new()),
                failures: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Execute a script and its dependency closure. Idempotent per ref for
    /// the lifetime of the executor: repeated requests observe the first
    /// dispatch's settled result.
    #[instrument(skip(self))]
    pub async fn execute(&self, script: &ScriptRef) -> ExecutionResult {
        self.inner.execute(script.clone()).await
    }

    /// Every failure recorded during execution, deduplicated by script,
    /// surfaced at the root.
    pub fn failures(&self) -> Vec<ExecFailure> {
        let failures = self.inner.failures.lock().expect("failures lock");
        let mut seen = HashSet::new();
        failures
            .iter()
            .filter(|failure| seen.insert(failure.script.clone()))
            .cloned()
            .collect()
    }

    pub fn supervisor(&self) -> &ServiceSupervisor {
        &self.inner.services
    }
}

impl Inner {
    async fn execute(self: &Arc<Self>, script: ScriptRef) -> ExecutionResult {
        let shared = {
            let mut executions = self.executions.lock().await;
            match executions.get(&script) {
                Some(found) => found.clone(),
                None => {
                    let future: SharedExecution = run_script(self.clone(), script.clone()).shared();
                    executions.insert(script, future.clone());
                    future
                }
            }
        };
        shared.await
    }

    /// Record a known failure, honoring the failure mode, and optionally
    /// emit the corresponding event (the supervisor emits its own).
    fn fail(
        &self,
        script: &ScriptRef,
        reason: FailureReason,
        message: impl Into<String>,
        fingerprint: Option<&Fingerprint>,
        emit: bool,
    ) -> ExecFailure {
        let message = message.into();
        self.any_failure.store(true, Ordering::Relaxed);
        if self.options.failure_mode == FailureMode::Kill {
            self.kill.cancel();
        }
        let failure = ExecFailure {
            script: script.clone(),
            kind: FailureKind::Known(reason),
            message: message.clone(),
            fingerprint: fingerprint.map(|f| f.string().to_owned()),
        };
        self.failures
            .lock()
            .expect("failures lock")
            .push(failure.clone());
        if emit {
            self.events.failure(script, reason, message);
        }
        failure
    }

    fn gate_closed(&self) -> bool {
        self.any_failure.load(Ordering::Relaxed)
            && self.options.failure_mode != FailureMode::Continue
    }
}

/// Guard releasing service consumer registrations when a dependent's
/// execution finishes, by whatever path.
struct ConsumerGuard {
    services: ServiceSupervisor,
    held: Vec<ScriptRef>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        for script in &self.held {
            self.services.release_consumer(script);
        }
    }
}

fn run_script(inner: Arc<Inner>, script: ScriptRef) -> BoxFuture<'static, ExecutionResult> {
    async move {
        match run_script_inner(&inner, &script).await {
            Ok(result) => result,
            Err(report) => {
                let message = format!("{report:#}");
                warn!(%script, %message, "unexpected error");
                inner.any_failure.store(true, Ordering::Relaxed);
                if inner.options.failure_mode == FailureMode::Kill {
                    inner.kill.cancel();
                }
                let failure = ExecFailure {
                    script: script.clone(),
                    kind: FailureKind::Unexpected,
                    message: message.clone(),
                    fingerprint: None,
                };
                inner
                    .failures
                    .lock()
                    .expect("failures lock")
                    .push(failure.clone());
                inner.events.emit(Event::UnexpectedError { script, message });
                Err(failure)
            }
        }
    }
    .boxed()
}

async fn run_script_inner(inner: &Arc<Inner>, script: &ScriptRef) -> Result<ExecutionResult> {
    let config = inner
        .graph
        .get(script)
        .cloned()
        .ok_or_eyre("script escaped analysis")?;

    if inner.cancel.is_cancelled() {
        return Ok(Err(inner.fail(
            script,
            FailureReason::StartCancelled,
            "not started because the invocation was aborted",
            None,
            true,
        )));
    }
    if inner.gate_closed() {
        return Ok(Err(inner.fail(
            script,
            FailureReason::StartCancelled,
            "not started because another script failed",
            None,
            true,
        )));
    }

    // Service records exist from first dispatch so consumers can observe
    // their state machine from the beginning.
    let service_record = if config.is_service() {
        let record = inner.services.register(config.clone());
        inner.services.mark_fingerprinting(&record);
        Some(record)
    } else {
        None
    };

    // 1. Dependencies, in parallel, in deliberately shuffled order.
    let mut edges = config.dependencies.clone();
    edges.shuffle(&mut rand::thread_rng());
    let dep_results = futures::future::join_all(edges.iter().map(|edge| {
        let inner = inner.clone();
        let to = edge.to.clone();
        async move { (edge, inner.execute(to).await) }
    }))
    .await;

    let mut dep_fingerprints: Vec<(String, Arc<Fingerprint>)> = Vec::new();
    let mut failed_deps: Vec<ScriptRef> = Vec::new();
    for (edge, result) in dep_results {
        match result {
            Ok(fingerprint) => {
                if edge.cascade {
                    dep_fingerprints.push((edge.to.label(), fingerprint));
                }
            }
            Err(_) => failed_deps.push(edge.to.clone()),
        }
    }
    if !failed_deps.is_empty() {
        if let Some(record) = &service_record {
            inner.services.mark_failed(record);
        }
        let message = format!(
            "dependency failed: {}",
            failed_deps.iter().map(ToString::to_string).join(", ")
        );
        return Ok(Err(inner.fail(
            script,
            FailureReason::DepFailed,
            message,
            None,
            true,
        )));
    }

    // 2. Effective service dependencies reach STARTED before any command of
    // ours spawns. Only command-bearing scripts consume services: a
    // no-command group has nothing to spawn (its dependents inherit the
    // services through the effective closure), and a service's own service
    // deps are started by the supervisor when the service itself starts.
    let mut guard = ConsumerGuard {
        services: inner.services.clone(),
        held: Vec::new(),
    };
    if matches!(config.execution, Execution::OneShot { .. }) {
        guard.held.extend(config.service_deps.iter().cloned());
        for service in &config.service_deps {
            match inner.services.start(service).await? {
                StartResult::Ready => {}
                StartResult::Failed(message) => {
                    return Ok(Err(inner.fail(
                        script,
                        FailureReason::DepFailed,
                        format!("service {service} failed to start: {message}"),
                        None,
                        true,
                    )));
                }
            }
        }
    }

    // 3. Fingerprint, from this config plus the cascading dep fingerprints.
    let fingerprint = Arc::new(Fingerprint::compute(&inner.fs, &config, &dep_fingerprints).await?);

    match &config.execution {
        // 4. Grouping-only scripts are done once their deps are.
        Execution::NoCommand => {
            inner.events.success(script, SuccessReason::NoCommand);
            Ok(Ok(fingerprint))
        }
        Execution::Service { .. } => {
            let record = service_record.expect("registered above");
            inner.services.mark_unstarted(&record);

            // A service's declared output flows through the same cache
            // pipeline as a standard script's: hermeticity check, restore
            // before spawn, capture once the service reports ready.
            if let Some(patterns) = &config.output {
                for pattern in patterns {
                    if let Err(err) = glob::ensure_inside(config.package(), pattern) {
                        inner.services.mark_failed(&record);
                        return Ok(Err(inner.fail(
                            script,
                            FailureReason::InvalidConfig,
                            format!("{err:#}"),
                            Some(&fingerprint),
                            true,
                        )));
                    }
                }
                if !prepare_service_output(inner, &config, &fingerprint).await? {
                    arm_output_capture(inner, &config, &fingerprint, &record);
                }
            }

            if config.directly_invoked {
                match inner.services.start(script).await? {
                    StartResult::Ready => Ok(Ok(fingerprint)),
                    // The supervisor already emitted the specific failure.
                    StartResult::Failed(message) => Ok(Err(inner.fail(
                        script,
                        FailureReason::DepServiceExit,
                        message,
                        Some(&fingerprint),
                        false,
                    ))),
                }
            } else {
                Ok(Ok(fingerprint))
            }
        }
        // 5. Standard scripts get the full freshness/cache/run pipeline.
        Execution::OneShot { command } => {
            run_standard(inner, &config, command, fingerprint, guard).await
        }
    }
}

async fn run_standard(
    inner: &Arc<Inner>,
    config: &Arc<ScriptConfig>,
    command: &str,
    fingerprint: Arc<Fingerprint>,
    _consumers: ConsumerGuard,
) -> Result<ExecutionResult> {
    let script = &config.script;

    // 5a. Output hermeticity: surface escapes before anything can delete.
    if let Some(patterns) = &config.output {
        for pattern in patterns {
            if let Err(err) = glob::ensure_inside(config.package(), pattern) {
                return Ok(Err(inner.fail(
                    script,
                    FailureReason::InvalidConfig,
                    format!("{err:#}"),
                    Some(&fingerprint),
                    true,
                )));
            }
        }
    }

    // Advisory lock: held for the rest of this script's run so concurrent
    // engine invocations can't collide on its state or output.
    let _lock = match acquire_lock(inner, script).await? {
        Ok(lock) => lock,
        Err(failure) => return Ok(Err(failure)),
    };

    // Watch bookkeeping: a script that failed last iteration and whose
    // inputs haven't changed would just fail again.
    if inner
        .options
        .failed_previously
        .get(script)
        .is_some_and(|failed_at| failed_at == fingerprint.string())
    {
        return Ok(Err(inner.fail(
            script,
            FailureReason::FailedPreviousWatchIteration,
            "failed in the previous watch iteration and nothing has changed",
            Some(&fingerprint),
            true,
        )));
    }

    // 5b. Freshness: nothing changed since the last successful run.
    let previous = inner.state.read_fingerprint(script).await?;
    if fingerprint.cacheable() && previous.as_deref() == Some(fingerprint.string()) {
        let replay = inner.state.read_replay(script).await?;
        emit_replay(&inner.events, script, &replay);
        inner.events.success(script, SuccessReason::Fresh);
        return Ok(Ok(fingerprint));
    }

    // 5c. Cache restore. Cache I/O failures are misses, never script
    // failures.
    if fingerprint.cacheable()
        && let Some(cache) = &inner.cache
    {
        match cache.get(script, fingerprint.digest()).await {
            Err(err) => warn!(%script, err = ?err, "cache lookup failed; treating as a miss"),
            Ok(None) => {}
            Ok(Some(hit)) => {
                // Existing output is deleted before any restore, whatever
                // the clean policy says about spawning.
                delete_output(inner, config).await?;
                match hit.apply(&inner.fs).await {
                    Err(err) => {
                        warn!(%script, err = ?err, "cache restore failed; running the command")
                    }
                    Ok(restored) => {
                        inner.state.write_replay(script, &restored.replay).await?;
                        emit_replay(&inner.events, script, &restored.replay);
                        // Only after a complete apply does the persisted
                        // fingerprint advance; a crash mid-restore reruns.
                        inner
                            .state
                            .write_fingerprint(script, fingerprint.string())
                            .await?;
                        inner.events.success(script, SuccessReason::Cached);
                        return Ok(Ok(fingerprint));
                    }
                }
            }
        }
    }

    // 5d. Clean before spawning, per policy.
    let delete_for_spawn = match config.clean {
        Clean::Always => true,
        Clean::Never => false,
        Clean::IfFileDeleted => match &previous {
            None => false,
            // Unreadable previous state: prefer a clean slate.
            Some(previous) => match Fingerprint::parse(previous) {
                Err(_) => true,
                Ok(parsed) => {
                    let mut any_deleted = false;
                    for rel in parsed.input_files() {
                        if !inner.fs.exists(config.package().join(rel)).await {
                            any_deleted = true;
                            break;
                        }
                    }
                    any_deleted
                }
            },
        },
    };
    if delete_for_spawn {
        delete_output(inner, config).await?;
    }

    // 5e. Parallelism reservation, immediately before spawn.
    let permit: Option<OwnedSemaphorePermit> = match &inner.spawn_permits {
        None => None,
        Some(semaphore) => {
            tokio::select! {
                permit = semaphore.clone().acquire_owned() => {
                    Some(permit.expect("spawn semaphore closed"))
                }
                _ = inner.cancel.cancelled() => {
                    return Ok(Err(inner.fail(
                        script,
                        FailureReason::StartCancelled,
                        "not started because the invocation was aborted",
                        Some(&fingerprint),
                        true,
                    )));
                }
            }
        }
    };
    // Something may have failed while we waited for a slot.
    if inner.gate_closed() {
        return Ok(Err(inner.fail(
            script,
            FailureReason::StartCancelled,
            "not started because another script failed",
            Some(&fingerprint),
            true,
        )));
    }

    // A crash between here and success must not look fresh next time.
    inner.state.delete_fingerprint(script).await?;

    inner.events.info(
        script,
        InfoDetail::Running {
            command: command.to_owned(),
        },
    );
    let mut cmd = spawn::build_command(config.package(), command, config.extra_args.as_deref());
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return Ok(Err(inner.fail(
                script,
                FailureReason::SpawnError,
                format!("failed to spawn command: {err}"),
                Some(&fingerprint),
                true,
            )));
        }
    };

    // 5f. Capture both streams into the event stream and replay buffers.
    let stdout_task = pump(&inner.events, script, OutputStream::Stdout, child.stdout.take());
    let stderr_task = pump(&inner.events, script, OutputStream::Stderr, child.stderr.take());

    let service_records: Vec<Arc<ServiceRecord>> = config
        .service_deps
        .iter()
        .filter_map(|service| inner.services.get(service))
        .collect();

    enum WaitOutcome {
        Exited(std::process::ExitStatus),
        Killed,
        ServiceExited,
    }

    let outcome = tokio::select! {
        status = child.wait() => WaitOutcome::Exited(status.context("await child")?),
        _ = inner.kill.cancelled() => WaitOutcome::Killed,
        _ = any_failed(service_records) => WaitOutcome::ServiceExited,
    };
    if !matches!(outcome, WaitOutcome::Exited(_)) {
        spawn::terminate(&mut child, spawn::GRACE_PERIOD).await?;
    }

    let stdout = stdout_task.await.context("join stdout task")?;
    let stderr = stderr_task.await.context("join stderr task")?;
    drop(permit);

    // 5g. Exit disposition.
    let status = match outcome {
        WaitOutcome::Killed => {
            return Ok(Err(inner.fail(
                script,
                FailureReason::Signal,
                "killed",
                Some(&fingerprint),
                true,
            )));
        }
        WaitOutcome::ServiceExited => {
            return Ok(Err(inner.fail(
                script,
                FailureReason::DepServiceExit,
                "a service this script depends on exited unexpectedly",
                Some(&fingerprint),
                true,
            )));
        }
        WaitOutcome::Exited(status) => status,
    };

    if !status.success() {
        return Ok(Err(match status.code() {
            Some(code) => inner.fail(
                script,
                FailureReason::ExitNonZero,
                format!("exited with status code {code}"),
                Some(&fingerprint),
                true,
            ),
            None => inner.fail(
                script,
                FailureReason::Signal,
                format!("exited due to a signal ({status})"),
                Some(&fingerprint),
                true,
            ),
        }));
    }

    // Success: persist replay, then cache, then (last) the fingerprint.
    let replay = Replay { stdout, stderr };
    inner.state.write_replay(script, &replay).await?;

    if fingerprint.cacheable() && config.output.is_some() && inner.cache.is_some() {
        match store_output(inner, config, &fingerprint, &replay).await {
            Err(err) => warn!(%script, err = ?err, "cache write failed; ignoring"),
            Ok(StoreOutcome::Skipped) => {
                inner.events.info(script, InfoDetail::CacheStoreSkipped);
            }
            Ok(StoreOutcome::Stored) => {}
        }
    }

    inner
        .state
        .write_fingerprint(script, fingerprint.string())
        .await?;
    inner.events.success(script, SuccessReason::ExitZero);
    Ok(Ok(fingerprint))
}

/// Bring a service's declared output up to date before it spawns.
///
/// Returns true when the output already matches this fingerprint (nothing
/// changed since the last capture, or the entry was just restored from the
/// cache), so nothing needs capturing at readiness.
async fn prepare_service_output(
    inner: &Arc<Inner>,
    config: &Arc<ScriptConfig>,
    fingerprint: &Arc<Fingerprint>,
) -> Result<bool> {
    let script = &config.script;
    let previous = inner.state.read_fingerprint(script).await?;
    if fingerprint.cacheable() && previous.as_deref() == Some(fingerprint.string()) {
        return Ok(true);
    }

    if fingerprint.cacheable()
        && let Some(cache) = &inner.cache
    {
        match cache.get(script, fingerprint.digest()).await {
            Err(err) => warn!(%script, err = ?err, "cache lookup failed; treating as a miss"),
            Ok(None) => {}
            Ok(Some(hit)) => {
                // Existing output is deleted before any restore.
                delete_output(inner, config).await?;
                match hit.apply(&inner.fs).await {
                    Err(err) => {
                        warn!(%script, err = ?err, "cache restore failed; the service regenerates")
                    }
                    Ok(_restored) => {
                        inner
                            .state
                            .write_fingerprint(script, fingerprint.string())
                            .await?;
                        return Ok(true);
                    }
                }
            }
        }
    }

    // The startup will regenerate; a crash mid-startup must not look fresh
    // next time.
    inner.state.delete_fingerprint(script).await?;
    Ok(false)
}

/// Once the service reports ready, snapshot its declared output into the
/// cache and advance the persisted fingerprint. Services never exit on
/// their own, so readiness is the point at which their startup output is
/// complete.
fn arm_output_capture(
    inner: &Arc<Inner>,
    config: &Arc<ScriptConfig>,
    fingerprint: &Arc<Fingerprint>,
    record: &Arc<ServiceRecord>,
) {
    let inner = inner.clone();
    let config = config.clone();
    let fingerprint = fingerprint.clone();
    let record = record.clone();
    tokio::spawn(async move {
        let StartResult::Ready = record.wait_started().await else {
            return;
        };
        let script = &config.script;
        if fingerprint.cacheable() && inner.cache.is_some() {
            // Service output streams are live, so no replay travels with
            // the entry.
            match store_output(&inner, &config, &fingerprint, &Replay::default()).await {
                Err(err) => warn!(%script, err = ?err, "cache write failed; ignoring"),
                Ok(StoreOutcome::Skipped) => {
                    inner.events.info(script, InfoDetail::CacheStoreSkipped);
                }
                Ok(StoreOutcome::Stored) => {}
            }
        }
        if let Err(err) = inner
            .state
            .write_fingerprint(script, fingerprint.string())
            .await
        {
            warn!(%script, err = ?err, "failed to persist service fingerprint");
        }
    });
}

/// Resolve the output globs and hand the matched entries to the cache.
async fn store_output(
    inner: &Arc<Inner>,
    config: &ScriptConfig,
    fingerprint: &Fingerprint,
    replay: &Replay,
) -> Result<StoreOutcome> {
    let cache = inner.cache.as_ref().ok_or_eyre("cache not configured")?;
    let patterns = config.output.as_ref().ok_or_eyre("output not declared")?;
    let entries = glob::resolve(
        config.package(),
        patterns,
        GlobOptions {
            allow_usually_excluded_paths: config.allow_usually_excluded_paths,
            ..Default::default()
        },
    )
    .await?;
    cache
        .set(&config.script, fingerprint.digest(), &entries, replay)
        .await
}

/// Delete the files and empty directories matched by the output globs.
/// Symlinks are unlinked without following.
async fn delete_output(inner: &Arc<Inner>, config: &ScriptConfig) -> Result<()> {
    let Some(patterns) = &config.output else {
        return Ok(());
    };
    for pattern in patterns {
        glob::ensure_inside(config.package(), pattern)?;
    }
    let entries = glob::resolve(
        config.package(),
        patterns,
        GlobOptions {
            allow_usually_excluded_paths: config.allow_usually_excluded_paths,
            ..Default::default()
        },
    )
    .await?;

    let mut dirs = Vec::new();
    for entry in &entries {
        match entry.kind {
            EntryKind::File | EntryKind::Symlink => inner.fs.remove_file(&entry.path).await?,
            EntryKind::Dir => dirs.push(entry.path.clone()),
        }
    }
    // Deepest first, so emptied children let their parents empty too.
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in dirs {
        inner.fs.remove_dir_if_empty(&dir).await?;
    }
    debug!(script = %config.script, "deleted output");
    Ok(())
}

/// Take the script's advisory lock, announcing contention and polling until
/// the holder releases it (or the invocation aborts).
async fn acquire_lock(
    inner: &Arc<Inner>,
    script: &ScriptRef,
) -> Result<std::result::Result<LockedFile, ExecFailure>> {
    let path = StateStore::lock_path(script);
    let lock = LockFile::open(&inner.fs, &path).await?;
    if let Some(held) = lock.try_lock().await? {
        return Ok(Ok(held));
    }

    inner
        .events
        .info(script, InfoDetail::Locked { lock: path.clone() });
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                return Ok(Err(inner.fail(
                    script,
                    FailureReason::Locked,
                    "aborted while waiting for another invocation's lock",
                    None,
                    true,
                )));
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                if let Some(held) = lock.try_lock().await? {
                    return Ok(Ok(held));
                }
            }
        }
    }
}

/// Stream a child output pipe into the event bus, collecting the replay
/// buffer.
fn pump<R>(
    events: &EventSender,
    script: &ScriptRef,
    stream: OutputStream,
    reader: Option<R>,
) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let events = events.clone();
    let script = script.clone();
    match reader {
        None => tokio::spawn(async { Vec::new() }),
        Some(reader) => tokio::spawn(async move {
            let mut buffer = Vec::new();
            let result = spawn::read_chunks(reader, |chunk| {
                buffer.extend_from_slice(&chunk);
                events.output(&script, stream, chunk);
            })
            .await;
            if let Err(err) = result {
                warn!(%script, ?err, "output stream closed abnormally");
            }
            buffer
        }),
    }
}

/// Resolve when any of the given services fails; pend forever otherwise.
async fn any_failed(records: Vec<Arc<ServiceRecord>>) {
    if records.is_empty() {
        return futures::future::pending().await;
    }
    let waits = records
        .iter()
        .map(|record| record.wait_failed().boxed())
        .collect::<Vec<_>>();
    futures::future::select_all(waits).await;
}

fn emit_replay(events: &EventSender, script: &ScriptRef, replay: &Replay) {
    if !replay.stdout.is_empty() {
        events.output(script, OutputStream::Stdout, replay.stdout.clone());
    }
    if !replay.stderr.is_empty() {
        events.output(script, OutputStream::Stderr, replay.stderr.clone());
    }
}
