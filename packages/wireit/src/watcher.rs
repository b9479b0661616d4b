//! Watch mode: re-run the root script whenever its inputs change.
//!
//! Two input sets are watched: the manifests of every package reachable
//! from the root (a change invalidates the manifest cache and forces
//! re-analysis), and the package directories of every script that declares
//! `files`. A burst of changes within the debounce window collapses into
//! one rerun; changes that land while a run is in progress mark the run
//! stale and trigger an immediate rerun on completion.
//!
//! Known failures (diagnostics, non-zero exits) never terminate the loop;
//! only unexpected errors and external abort do.

use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    time::Duration,
};

use color_eyre::{Result, eyre::Context};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    analyzer::Analyzer,
    cache::Cache,
    event::{EventSender, InfoDetail},
    executor::{ExecFailure, ExecuteOptions, Executor, FailureKind},
    fs::Fs,
    script::ScriptRef,
    service::ServiceSupervisor,
};

/// How long to let a burst of file-system events settle before rerunning.
pub const DEBOUNCE: Duration = Duration::from_millis(50);

/// Options for a watch session; the per-iteration execution options are
/// rebuilt from these each run.
#[derive(Clone, Debug, Default)]
pub struct WatchOptions {
    pub execute: ExecuteOptions,
}

/// Watch `root`, re-running it on changes until `cancel` fires.
///
/// Returns `Ok` on orderly abort; unexpected errors propagate.
#[instrument(skip_all, fields(%root))]
pub async fn watch(
    analyzer: &Analyzer,
    fs: &Fs,
    cache: Option<Cache>,
    events: &EventSender,
    root: &ScriptRef,
    extra_args: &[String],
    options: WatchOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let (change_tx, mut change_rx) = mpsc::unbounded_channel::<()>();
    let mut iteration: u64 = 0;
    let mut failed_previously: HashMap<ScriptRef, String> = HashMap::new();
    // The previous iteration's subscriptions stay alive until the new ones
    // replace them, so changes landing during re-analysis still retrigger.
    let mut _subscriptions: Option<RecommendedWatcher> = None;

    loop {
        iteration += 1;
        events.info(root, InfoDetail::WatchRun { iteration });

        // Everything that changed up to this point is observed by the
        // analysis below, so pending notifications are spent. Changes that
        // land *during* analysis stay queued (the previous iteration's
        // subscriptions are still alive) and mark the run stale.
        while change_rx.try_recv().is_ok() {}

        // Re-analyze from scratch: manifest edits must be observed.
        analyzer.reader().invalidate_all().await;
        let analysis = analyzer.analyze(root, extra_args).await?;

        // (Re)register subscriptions for whatever this analysis can see.
        // On analysis failure we still watch the root manifest so a fix
        // retriggers us.
        let watch_paths = match &analysis {
            Ok(graph) => watch_paths(graph),
            Err(_) => BTreeSet::from([root.manifest_path()]),
        };
        _subscriptions = Some(subscribe(&watch_paths, change_tx.clone())?);

        let mut stale = false;
        // Kept alive across the idle wait so that services (notably a
        // directly-invoked one) stay up until the next rerun is due.
        let mut current: Option<Executor> = None;
        match analysis {
            Err(failure) => {
                for diagnostic in &failure.diagnostics {
                    events.failure_diagnostic(root, failure.reason, diagnostic.clone());
                }
            }
            Ok(graph) => {
                let supervisor = ServiceSupervisor::new(events.clone(), cancel.child_token());
                let executor = Executor::new(
                    graph,
                    fs.clone(),
                    cache.clone(),
                    events.clone(),
                    supervisor,
                    ExecuteOptions {
                        failed_previously: std::mem::take(&mut failed_previously),
                        ..options.execute.clone()
                    },
                    cancel.child_token(),
                );

                // Run to completion, noticing changes that arrive mid-run.
                // Scoped so the pinned future releases its borrow of the
                // executor before the executor is kept for the idle wait.
                let result = {
                    let run = executor.execute(root);
                    tokio::pin!(run);
                    loop {
                        tokio::select! {
                            result = &mut run => break Some(result),
                            changed = change_rx.recv() => {
                                if changed.is_some() {
                                    trace!("change during run; marking stale");
                                    stale = true;
                                }
                            }
                            _ = cancel.cancelled() => break None,
                        }
                    }
                };

                match result {
                    // Aborted mid-run.
                    None => {
                        executor.supervisor().shutdown_all().await;
                        return Ok(());
                    }
                    Some(result) => {
                        failed_previously = collect_failures(&executor, result.err());
                    }
                }
                current = Some(executor);
            }
        }

        if cancel.is_cancelled() {
            shutdown(current).await;
            return Ok(());
        }

        if !stale {
            // Idle: wait for the next change, then debounce the burst.
            tokio::select! {
                changed = change_rx.recv() => {
                    if changed.is_none() {
                        shutdown(current).await;
                        return Ok(());
                    }
                }
                _ = cancel.cancelled() => {
                    shutdown(current).await;
                    return Ok(());
                }
            }
            tokio::time::sleep(DEBOUNCE).await;
        }

        // A rerun is due: wind down this iteration's services first.
        shutdown(current).await;
    }
}

async fn shutdown(executor: Option<Executor>) {
    if let Some(executor) = executor {
        executor.supervisor().shutdown_all().await;
    }
}

/// The set of paths to watch for one analysis: every reachable manifest,
/// plus the package directory of every script that declares input files.
fn watch_paths(graph: &crate::analyzer::ScriptGraph) -> BTreeSet<PathBuf> {
    let mut paths = graph.manifests();
    for config in graph.scripts.values() {
        if config.files.as_ref().is_some_and(|files| !files.is_empty()) {
            paths.insert(config.script.package.clone());
        }
    }
    paths
}

/// Register notify subscriptions for the given paths. The returned watcher
/// owns the subscriptions; dropping it tears them down.
fn subscribe(
    paths: &BTreeSet<PathBuf>,
    changes: mpsc::UnboundedSender<()>,
) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        match event {
            Ok(event) => {
                // The engine's own state writes under `.wireit/` must not
                // retrigger the loop.
                let relevant = event.paths.is_empty()
                    || event.paths.iter().any(|path| {
                        !path
                            .components()
                            .any(|component| component.as_os_str() == ".wireit")
                    });
                if relevant {
                    trace!(?event, "file system event");
                    let _ = changes.send(());
                }
            }
            Err(err) => warn!(?err, "file watcher error"),
        }
    })
    .context("create file watcher")?;

    for path in paths {
        let mode = if path.is_dir() {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        // A path can legitimately be missing (a package referenced before
        // it is created); the manifest diagnostic covers that case.
        if let Err(err) = watcher.watch(path, mode) {
            debug!(?path, ?err, "could not watch path");
        }
    }
    Ok(watcher)
}

/// Build the next iteration's failed-previously set: every known failure
/// that carries the fingerprint it failed at.
fn collect_failures(
    executor: &Executor,
    root_failure: Option<ExecFailure>,
) -> HashMap<ScriptRef, String> {
    let mut failed = HashMap::new();
    for failure in executor.failures().into_iter().chain(root_failure) {
        if let (FailureKind::Known(_), Some(fingerprint)) = (failure.kind, failure.fingerprint) {
            failed.insert(failure.script, fingerprint);
        }
    }
    failed
}
