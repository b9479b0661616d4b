//! Integration test harness: builds throwaway package trees, runs them
//! through the engine, and records the emitted event stream.

use std::path::PathBuf;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use wireit::{
    analyzer::Analyzer,
    cache::{Cache, LocalCache},
    event::{self, Event, FailureReason, SuccessReason},
    executor::{ExecuteOptions, ExecutionResult, Executor},
    fs::Fs,
    manifest::ManifestReader,
    script::ScriptRef,
    service::ServiceSupervisor,
};

pub mod engine;
pub mod executor;
pub mod service;
pub mod watch;

/// A throwaway package tree.
pub struct TestRig {
    _temp: TempDir,
    pub package: PathBuf,
}

impl TestRig {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("create temporary directory");
        let package = temp
            .path()
            .canonicalize()
            .expect("canonicalize temporary directory");
        Self {
            _temp: temp,
            package,
        }
    }

    pub fn manifest(&self, value: serde_json::Value) {
        self.manifest_in(".", value);
    }

    pub fn manifest_in(&self, rel: &str, value: serde_json::Value) {
        let dir = self.package.join(rel);
        std::fs::create_dir_all(&dir).expect("create package directory");
        std::fs::write(
            dir.join("package.json"),
            serde_json::to_string_pretty(&value).expect("serialize manifest"),
        )
        .expect("write manifest");
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.package.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent directory");
        }
        std::fs::write(path, content).expect("write file");
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        std::fs::read_to_string(self.package.join(rel)).ok()
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.package.join(rel).exists()
    }

    /// Number of lines in a run-witness file (0 if it doesn't exist).
    pub fn line_count(&self, rel: &str) -> usize {
        self.read(rel).map_or(0, |content| content.lines().count())
    }

    pub fn script(&self, name: &str) -> ScriptRef {
        ScriptRef::new(&self.package, name)
    }
}

/// An executor wired to a fresh analysis of the rig, plus a collector for
/// everything it emits.
pub struct Session {
    pub executor: Executor,
    pub root: ScriptRef,
    collector: tokio::task::JoinHandle<Vec<Event>>,
    pub cancel: CancellationToken,
}

impl Session {
    pub async fn build(rig: &TestRig, name: &str, options: ExecuteOptions) -> Self {
        let fs = Fs::default();
        let analyzer = Analyzer::new(ManifestReader::new(fs.clone()), fs.clone());
        let root = rig.script(name);
        let graph = analyzer
            .analyze(&root, &[])
            .await
            .expect("analysis io")
            .expect("analysis must succeed");

        let (events, mut receiver) = event::channel();
        let collector = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(event) = receiver.recv().await {
                out.push(event);
            }
            out
        });

        let cancel = CancellationToken::new();
        let supervisor = ServiceSupervisor::new(events.clone(), cancel.child_token());
        let executor = Executor::new(
            graph,
            fs.clone(),
            Some(Cache::Local(LocalCache::new(fs))),
            events,
            supervisor,
            options,
            cancel.clone(),
        );
        Self {
            executor,
            root,
            collector,
            cancel,
        }
    }

    /// Run the root to completion, wind services down, and return the
    /// result with every event emitted along the way.
    pub async fn finish(self) -> (ExecutionResult, Vec<Event>) {
        let result = self.executor.execute(&self.root).await;
        self.executor.supervisor().shutdown_all().await;
        drop(self.executor);
        let events = self.collector.await.expect("join collector");
        (result, events)
    }
}

/// Run one script to completion with the given options.
pub async fn execute(
    rig: &TestRig,
    name: &str,
    options: ExecuteOptions,
) -> (ExecutionResult, Vec<Event>) {
    Session::build(rig, name, options).await.finish().await
}

/// The success events, as (script name, reason) pairs in emission order.
pub fn successes(events: &[Event]) -> Vec<(String, SuccessReason)> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Success { script, reason } => Some((script.name.clone(), *reason)),
            _ => None,
        })
        .collect()
}

/// The failure events, as (script name, reason) pairs in emission order.
pub fn failures(events: &[Event]) -> Vec<(String, FailureReason)> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Failure { script, reason, .. } => Some((script.name.clone(), *reason)),
            _ => None,
        })
        .collect()
}

/// The success reason recorded for one script, if any.
pub fn success_reason(events: &[Event], name: &str) -> Option<SuccessReason> {
    successes(events)
        .into_iter()
        .find(|(script, _)| script == name)
        .map(|(_, reason)| reason)
}

/// Concatenated stdout replayed or streamed for one script.
pub fn stdout_of(events: &[Event], name: &str) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Output { script, stream, chunk }
                if script.name == name && *stream == event::OutputStream::Stdout =>
            {
                Some(chunk.clone())
            }
            _ => None,
        })
        .flatten()
        .collect()
}

/// Poll until `predicate` holds or the timeout elapses.
pub async fn wait_until(mut predicate: impl FnMut() -> bool, timeout: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
}
