//! Whole-engine scenarios: analysis failures surface as events, workspace
//! fanout, exit outcome mapping.
#![cfg(unix)]

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use wireit::{
    engine::{CacheChoice, Engine, EngineOptions, RunOutcome},
    event::{self, Event, FailureReason},
    script::ScriptRef,
};

use crate::TestRig;

async fn run_engine(root: ScriptRef) -> (RunOutcome, Vec<Event>) {
    let (events, mut receiver) = event::channel();
    let collector = tokio::spawn(async move {
        let mut out = Vec::new();
        while let Some(event) = receiver.recv().await {
            out.push(event);
        }
        out
    });

    let engine = Engine::new(
        EngineOptions {
            cache: CacheChoice::Local,
            ..Default::default()
        },
        events,
    );
    let outcome = engine
        .run(&root, &[], CancellationToken::new())
        .await
        .expect("engine must not hit unexpected errors");
    drop(engine);
    (outcome, collector.await.expect("join collector"))
}

/// Workspace fanout: `$WORKSPACES` expands to every workspace declaring
/// the script, each runs exactly once, and excluded workspaces don't.
#[test_log::test(tokio::test)]
async fn workspace_fanout() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"cmd": "wireit"},
        "workspaces": ["packages/*", "!packages/pkg3"],
        "wireit": {"cmd": {"dependencies": ["$WORKSPACES"]}}
    }));
    for pkg in ["pkg1", "pkg2", "pkg3"] {
        rig.manifest_in(
            &format!("packages/{pkg}"),
            json!({
                "scripts": {"cmd": "wireit"},
                "wireit": {"cmd": {"command": "echo ran >> cmd.runs"}}
            }),
        );
    }

    let (outcome, _) = run_engine(rig.script("cmd")).await;
    assert_eq!(outcome, RunOutcome::Success);
    assert_eq!(rig.line_count("packages/pkg1/cmd.runs"), 1);
    assert_eq!(rig.line_count("packages/pkg2/cmd.runs"), 1);
    assert_eq!(rig.line_count("packages/pkg3/cmd.runs"), 0);
}

/// Cycle detection: a single cycle diagnostic naming the refs in
/// dependency order, and neither command spawns.
#[test_log::test(tokio::test)]
async fn cycle_is_one_diagnostic_and_nothing_runs() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"a": "wireit", "b": "wireit"},
        "wireit": {
            "a": {"command": "echo ran >> a.runs", "dependencies": ["b"]},
            "b": {"command": "echo ran >> b.runs", "dependencies": ["a"]}
        }
    }));

    let (outcome, events) = run_engine(rig.script("a")).await;
    assert_eq!(outcome, RunOutcome::KnownFailure);
    assert!(!rig.exists("a.runs"));
    assert!(!rig.exists("b.runs"));

    let cycle_events: Vec<&Event> = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                Event::Failure {
                    reason: FailureReason::Cycle,
                    ..
                }
            )
        })
        .collect();
    assert_eq!(cycle_events.len(), 1, "exactly one cycle diagnostic");
    let Event::Failure { message, .. } = cycle_events[0] else {
        unreachable!()
    };
    let a = rig.script("a").to_string();
    let b = rig.script("b").to_string();
    assert!(
        message.contains(&format!("{a} -> {b} -> {a}")),
        "cycle names every ref in dependency order: {message}"
    );
}

/// A manifest with no scripts at all maps to the no-scripts-to-run
/// failure.
#[test_log::test(tokio::test)]
async fn empty_manifest_has_no_scripts_to_run() {
    let rig = TestRig::new();
    rig.manifest(json!({}));

    let (outcome, events) = run_engine(rig.script("build")).await;
    assert_eq!(outcome, RunOutcome::KnownFailure);
    assert!(events.iter().any(|event| matches!(
        event,
        Event::Failure {
            reason: FailureReason::NoScriptsToRun,
            ..
        }
    )));
}

/// Dependency failures aggregate at the root as a deduplicated set: one
/// terminal failure event per script.
#[test_log::test(tokio::test)]
async fn failures_are_deduplicated_per_script() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"all": "wireit", "x": "wireit", "y": "wireit", "bad": "wireit"},
        "wireit": {
            "all": {"dependencies": ["x", "y"]},
            "x": {"command": "echo ran >> x.runs", "dependencies": ["bad"]},
            "y": {"command": "echo ran >> y.runs", "dependencies": ["bad"]},
            "bad": {"command": "exit 1"}
        }
    }));

    let (outcome, events) = run_engine(rig.script("all")).await;
    assert_eq!(outcome, RunOutcome::KnownFailure);

    let bad_failures = crate::failures(&events)
        .into_iter()
        .filter(|(name, _)| name == "bad")
        .count();
    assert_eq!(bad_failures, 1, "the failing script fails exactly once");
}
