//! Executor scenarios: freshness, caching, cleaning, parallelism.
#![cfg(unix)]

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use wireit::{
    event::SuccessReason,
    executor::{ExecuteOptions, Parallelism},
};

use crate::{TestRig, execute, stdout_of, success_reason};

fn options() -> ExecuteOptions {
    ExecuteOptions::default()
}

/// Caches by content: v0 -> v1 -> revert to v0 restores the v0 output
/// without running the command again.
#[test_log::test(tokio::test)]
async fn caches_by_content() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"build": "wireit"},
        "wireit": {
            "build": {
                "command": "cat input > output && echo ran >> build.runs",
                "files": ["input"],
                "output": ["output"]
            }
        }
    }));

    rig.write("input", "v0");
    let (result, _) = execute(&rig, "build", options()).await;
    result.expect("first run succeeds");
    assert_eq!(rig.read("output").as_deref(), Some("v0"));
    assert_eq!(rig.line_count("build.runs"), 1);

    rig.write("input", "v1");
    let (result, _) = execute(&rig, "build", options()).await;
    result.expect("second run succeeds");
    assert_eq!(rig.read("output").as_deref(), Some("v1"));
    assert_eq!(rig.line_count("build.runs"), 2);

    // Revert: the output comes back from the cache, byte for byte, and the
    // command does not run.
    rig.write("input", "v0");
    let (result, events) = execute(&rig, "build", options()).await;
    result.expect("third run succeeds");
    assert_eq!(success_reason(&events, "build"), Some(SuccessReason::Cached));
    assert_eq!(rig.read("output").as_deref(), Some("v0"));
    assert_eq!(rig.line_count("build.runs"), 2);
}

/// Freshness: if nothing changed, the command does not re-run and the
/// captured stdout replays.
#[test_log::test(tokio::test)]
async fn unchanged_script_is_fresh_and_replays_stdout() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"build": "wireit"},
        "wireit": {
            "build": {
                "command": "echo hello from build && echo ran >> build.runs",
                "files": ["input"],
                "output": []
            }
        }
    }));
    rig.write("input", "v0");

    let (result, events) = execute(&rig, "build", options()).await;
    result.expect("first run succeeds");
    assert_eq!(
        success_reason(&events, "build"),
        Some(SuccessReason::ExitZero)
    );
    assert_eq!(stdout_of(&events, "build"), b"hello from build\n");

    let (result, events) = execute(&rig, "build", options()).await;
    result.expect("second run succeeds");
    assert_eq!(success_reason(&events, "build"), Some(SuccessReason::Fresh));
    assert_eq!(stdout_of(&events, "build"), b"hello from build\n");
    assert_eq!(rig.line_count("build.runs"), 1);
}

/// At-most-once: a script reachable through several dependency paths runs
/// exactly once per invocation.
#[test_log::test(tokio::test)]
async fn diamond_dependency_runs_once() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"all": "wireit", "left": "wireit", "right": "wireit", "base": "wireit"},
        "wireit": {
            "all": {"dependencies": ["left", "right"]},
            "left": {"command": "echo ran >> left.runs", "dependencies": ["base"]},
            "right": {"command": "echo ran >> right.runs", "dependencies": ["base"]},
            "base": {"command": "echo ran >> base.runs"}
        }
    }));

    let (result, events) = execute(&rig, "all", options()).await;
    result.expect("run succeeds");
    assert_eq!(rig.line_count("base.runs"), 1);
    assert_eq!(rig.line_count("left.runs"), 1);
    assert_eq!(rig.line_count("right.runs"), 1);
    assert_eq!(success_reason(&events, "all"), Some(SuccessReason::NoCommand));
}

/// Clean policy `true`: prior output is gone when the command starts.
#[test_log::test(tokio::test)]
async fn clean_true_deletes_before_spawn() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"build": "wireit"},
        "wireit": {
            "build": {
                "command": "if [ -e out/stale ]; then echo present > witness; else echo absent > witness; fi; mkdir -p out && cp input out/fresh",
                "files": ["input"],
                "output": ["out"],
                "clean": true
            }
        }
    }));
    rig.write("input", "v0");
    rig.write("out/stale", "stale");

    let (result, _) = execute(&rig, "build", options()).await;
    result.expect("run succeeds");
    assert_eq!(rig.read("witness").as_deref(), Some("absent\n"));
    assert!(!rig.exists("out/stale"));
}

/// Clean policy `false`: prior output is still present when the command
/// starts.
#[test_log::test(tokio::test)]
async fn clean_false_keeps_prior_output() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"build": "wireit"},
        "wireit": {
            "build": {
                "command": "if [ -e out/stale ]; then echo present > witness; else echo absent > witness; fi; mkdir -p out && cp input out/fresh",
                "files": ["input"],
                "output": ["out"],
                "clean": false
            }
        }
    }));
    rig.write("input", "v0");
    rig.write("out/stale", "stale");

    let (result, _) = execute(&rig, "build", options()).await;
    result.expect("run succeeds");
    assert_eq!(rig.read("witness").as_deref(), Some("present\n"));
    assert!(rig.exists("out/stale"));
}

/// Clean policy `if-file-deleted`: prior output is deleted iff a
/// previously-recorded input file no longer exists.
#[test_log::test(tokio::test)]
async fn clean_if_file_deleted() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"build": "wireit"},
        "wireit": {
            "build": {
                "command": "if [ -e out/stale ]; then echo present > witness; else echo absent > witness; fi; mkdir -p out && touch out/stale",
                "files": ["inputs/*"],
                "output": ["out"],
                "clean": "if-file-deleted"
            }
        }
    }));
    rig.write("inputs/a", "a");
    rig.write("inputs/b", "b");

    let (result, _) = execute(&rig, "build", options()).await;
    result.expect("first run succeeds");

    // Changing a file (not deleting) keeps prior output.
    rig.write("inputs/a", "a2");
    let (result, _) = execute(&rig, "build", options()).await;
    result.expect("second run succeeds");
    assert_eq!(rig.read("witness").as_deref(), Some("present\n"));

    // Deleting a previously-recorded input clears the output first.
    std::fs::remove_file(rig.package.join("inputs/b")).unwrap();
    let (result, _) = execute(&rig, "build", options()).await;
    result.expect("third run succeeds");
    assert_eq!(rig.read("witness").as_deref(), Some("absent\n"));
}

/// Output hermeticity: an output glob escaping the package directory
/// aborts before any deletion and before the command runs.
#[test_log::test(tokio::test)]
async fn output_outside_package_aborts_without_deleting() {
    let rig = TestRig::new();
    rig.manifest_in("pkg", json!({
        "scripts": {"build": "wireit"},
        "wireit": {
            "build": {
                "command": "echo ran >> build.runs",
                "files": [],
                "output": ["../outside"]
            }
        }
    }));
    rig.write("outside", "precious");

    let root = wireit::script::ScriptRef::new(rig.package.join("pkg"), "build");
    let fs = wireit::fs::Fs::default();
    let analyzer =
        wireit::analyzer::Analyzer::new(wireit::manifest::ManifestReader::new(fs.clone()), fs);
    let graph = analyzer.analyze(&root, &[]).await.unwrap().unwrap();

    let (events, mut receiver) = wireit::event::channel();
    let cancel = tokio_util::sync::CancellationToken::new();
    let supervisor =
        wireit::service::ServiceSupervisor::new(events.clone(), cancel.child_token());
    let executor = wireit::executor::Executor::new(
        graph,
        wireit::fs::Fs::default(),
        None,
        events,
        supervisor,
        options(),
        cancel,
    );
    let result = executor.execute(&root).await;
    drop(executor);

    let failure = result.expect_err("escaping output must fail");
    assert_eq!(
        failure.kind,
        wireit::executor::FailureKind::Known(wireit::event::FailureReason::InvalidConfig)
    );
    assert_eq!(rig.read("outside").as_deref(), Some("precious"));
    assert!(!rig.exists("pkg/build.runs"));

    let mut saw_invalid_config = false;
    while let Ok(event) = receiver.try_recv() {
        if let wireit::event::Event::Failure { reason, .. } = event {
            saw_invalid_config |= reason == wireit::event::FailureReason::InvalidConfig;
        }
    }
    assert!(saw_invalid_config);
}

/// Parallelism bound 1: commands are strictly serialized.
#[test_log::test(tokio::test)]
async fn parallelism_one_serializes_commands() {
    let rig = TestRig::new();
    let command = |name: &str| {
        format!("echo start-{name} >> order.log; sleep 0.2; echo end-{name} >> order.log")
    };
    rig.manifest(json!({
        "scripts": {"all": "wireit", "a": "wireit", "b": "wireit", "c": "wireit"},
        "wireit": {
            "all": {"dependencies": ["a", "b", "c"]},
            "a": {"command": command("a")},
            "b": {"command": command("b")},
            "c": {"command": command("c")}
        }
    }));

    let (result, _) = execute(
        &rig,
        "all",
        ExecuteOptions {
            parallelism: Parallelism::Bounded(1),
            ..Default::default()
        },
    )
    .await;
    result.expect("run succeeds");

    let log = rig.read("order.log").expect("order log exists");
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 6, "each of three scripts starts and ends");
    // Strict serialization: every start is immediately followed by its own
    // end.
    for pair in lines.chunks(2) {
        let start = pair[0].strip_prefix("start-").expect("starts come first");
        let end = pair[1].strip_prefix("end-").expect("ends come second");
        assert_eq!(start, end, "no interleaving under parallelism 1");
    }
}

/// Symlink handling: cleaning unlinks the symlink but leaves the target;
/// fingerprinting follows the link for content and records the target path.
#[test_log::test(tokio::test)]
async fn symlinks_clean_without_following() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"build": "wireit"},
        "wireit": {
            "build": {
                "command": "echo ran >> build.runs",
                "files": ["input"],
                "output": ["link"],
                "clean": true
            }
        }
    }));
    rig.write("input", "v0");
    rig.write("target", "kept");
    std::os::unix::fs::symlink(rig.package.join("target"), rig.package.join("link")).unwrap();

    let (result, _) = execute(&rig, "build", options()).await;
    result.expect("run succeeds");
    assert!(!rig.exists("link"), "symlink is removed");
    assert_eq!(rig.read("target").as_deref(), Some("kept"));
}

/// Failure mode no-new: after a failure, scripts that have not started yet
/// are cancelled, and the whole run fails.
#[test_log::test(tokio::test)]
async fn failure_fails_dependents() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"all": "wireit", "bad": "wireit", "after": "wireit"},
        "wireit": {
            "all": {"command": "echo ran >> all.runs", "dependencies": ["after"]},
            "after": {"command": "echo ran >> after.runs", "dependencies": ["bad"]},
            "bad": {"command": "exit 7"}
        }
    }));

    let (result, events) = execute(&rig, "all", options()).await;
    let failure = result.expect_err("run must fail");
    assert_eq!(
        failure.kind,
        wireit::executor::FailureKind::Known(wireit::event::FailureReason::DepFailed)
    );
    assert_eq!(rig.line_count("after.runs"), 0);
    assert_eq!(rig.line_count("all.runs"), 0);

    let failures = crate::failures(&events);
    assert!(
        failures
            .iter()
            .any(|(name, reason)| name == "bad"
                && *reason == wireit::event::FailureReason::ExitNonZero)
    );
    assert!(
        failures
            .iter()
            .any(|(name, reason)| name == "after"
                && *reason == wireit::event::FailureReason::DepFailed)
    );
}

/// Extra-arg pass-through does not participate in the fingerprint: a
/// script stays fresh across arg changes.
#[test_log::test(tokio::test)]
async fn plain_script_dependency_runs() {
    let rig = TestRig::new();
    // A dependency declared only in `scripts` (no wireit config) still runs
    // as an uncacheable standard script.
    rig.manifest(json!({
        "scripts": {"all": "wireit", "plain": "echo ran >> plain.runs"},
        "wireit": {
            "all": {"command": "echo ran >> all.runs", "dependencies": ["plain"]}
        }
    }));

    let (result, _) = execute(&rig, "all", options()).await;
    result.expect("run succeeds");
    assert_eq!(rig.line_count("plain.runs"), 1);
    assert_eq!(rig.line_count("all.runs"), 1);

    // The plain dependency has no declared files, so it re-runs, and the
    // cascade re-runs its dependent too.
    let (result, _) = execute(&rig, "all", options()).await;
    result.expect("second run succeeds");
    assert_eq!(rig.line_count("plain.runs"), 2);
}

/// Abort: cancelling mid-run kills the child within the grace bound and
/// the engine returns.
#[test_log::test(tokio::test)]
async fn abort_kills_children_within_bound() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"slow": "wireit"},
        "wireit": {
            "slow": {"command": "echo started >> slow.runs; sleep 60"}
        }
    }));

    let session = crate::Session::build(&rig, "slow", options()).await;
    let cancel = session.cancel.clone();
    let started = std::time::Instant::now();

    let rig_package = rig.package.clone();
    tokio::spawn(async move {
        // Give the child a moment to spawn, then abort.
        let _ = crate::wait_until(
            move || {
                std::fs::read_to_string(rig_package.join("slow.runs"))
                    .is_ok_and(|content| !content.is_empty())
            },
            Duration::from_secs(5),
        )
        .await;
        cancel.cancel();
    });

    let (result, _) = session.finish().await;
    result.expect_err("aborted run fails");
    assert!(
        started.elapsed() < Duration::from_secs(30),
        "abort returns within the grace bound"
    );
}
