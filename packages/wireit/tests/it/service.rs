//! Service lifecycle scenarios.
#![cfg(unix)]

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use wireit::{
    event::{Event, FailureReason, InfoDetail},
    executor::ExecuteOptions,
    service::ServiceState,
};

use crate::{Session, TestRig, wait_until};

/// Service teardown: the consumer's command spawns only after the service
/// is STARTED, and the service stops after the last consumer finishes.
#[test_log::test(tokio::test)]
async fn service_starts_before_consumer_and_stops_after() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"serve": "wireit", "consume": "wireit"},
        "wireit": {
            "serve": {"command": "touch serving; sleep 60", "service": true},
            "consume": {
                "command": "if [ -e serving ]; then echo saw-service >> consume.runs; fi",
                "dependencies": [{"script": "serve", "cascade": true}]
            }
        }
    }));

    let session = Session::build(&rig, "consume", ExecuteOptions::default()).await;
    let supervisor = session.executor.supervisor().clone();
    let (result, events) = session.finish().await;
    result.expect("consumer succeeds");

    // The service was up when the consumer ran.
    assert_eq!(rig.line_count("consume.runs"), 1);

    // And it wound down once its only consumer finished.
    let record = supervisor.get(&rig.script("serve")).expect("service record");
    record.wait_terminated().await;
    assert_eq!(record.state(), ServiceState::Stopped);
    assert!(events.iter().any(|event| matches!(
        event,
        Event::Info {
            detail: InfoDetail::ServiceStopped,
            ..
        }
    )));
}

/// A directly-invoked service stays STARTED until abort.
#[test_log::test(tokio::test)]
async fn directly_invoked_service_persists_until_abort() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"serve": "wireit"},
        "wireit": {
            "serve": {"command": "sleep 60", "service": true}
        }
    }));

    let session = Session::build(&rig, "serve", ExecuteOptions::default()).await;
    let supervisor = session.executor.supervisor().clone();
    let root = session.root.clone();

    let result = session.executor.execute(&root).await;
    result.expect("service starts");

    let record = supervisor.get(&root).expect("service record");
    assert_eq!(record.state(), ServiceState::Started);

    // No consumers, but directly invoked: it must stay up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(record.state(), ServiceState::Started);

    // Abort brings it down within the grace bound.
    let (result, _) = session.finish().await;
    result.expect("memoized execution result is unchanged");
    assert_eq!(record.state(), ServiceState::Stopped);
}

/// Line-match readiness: the consumer waits for the first matching output
/// line before spawning.
#[test_log::test(tokio::test)]
async fn line_match_readiness_gates_consumers() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"serve": "wireit", "consume": "wireit"},
        "wireit": {
            "serve": {
                "command": "echo warming up; sleep 0.2; touch serving; echo listening on port 8080; sleep 60",
                "service": {"readyWhen": {"line-matches": "listening on port \\d+"}}
            },
            "consume": {
                "command": "if [ -e serving ]; then echo ready >> consume.runs; fi",
                "dependencies": ["serve"]
            }
        }
    }));

    let (result, _) = crate::execute(&rig, "consume", ExecuteOptions::default()).await;
    result.expect("consumer succeeds");
    // The consumer only saw the service after its ready line.
    assert_eq!(rig.line_count("consume.runs"), 1);
}

/// A service that exits unexpectedly fails its dependents with
/// dep-service-exit.
#[test_log::test(tokio::test)]
async fn service_exit_fails_running_consumers() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"serve": "wireit", "consume": "wireit"},
        "wireit": {
            "serve": {"command": "sleep 0.2", "service": true},
            "consume": {
                "command": "sleep 30",
                "dependencies": ["serve"]
            }
        }
    }));

    let started = std::time::Instant::now();
    let (result, events) = crate::execute(&rig, "consume", ExecuteOptions::default()).await;
    let failure = result.expect_err("consumer fails when the service dies");
    assert_eq!(
        failure.kind,
        wireit::executor::FailureKind::Known(FailureReason::DepServiceExit)
    );
    assert!(
        started.elapsed() < Duration::from_secs(25),
        "consumer was killed, not waited out"
    );
    assert!(
        crate::failures(&events)
            .iter()
            .any(|(name, reason)| name == "serve" && *reason == FailureReason::DepServiceExit)
    );
}

/// Effective service dependencies: a service reached through a no-command
/// group still starts before the consumer's command.
#[test_log::test(tokio::test)]
async fn service_through_group_starts_first() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"app": "wireit", "group": "wireit", "serve": "wireit"},
        "wireit": {
            "app": {
                "command": "if [ -e serving ]; then echo saw >> app.runs; fi",
                "dependencies": ["group"]
            },
            "group": {"dependencies": ["serve"]},
            "serve": {"command": "touch serving; sleep 60", "service": true}
        }
    }));

    let (result, _) = crate::execute(&rig, "app", ExecuteOptions::default()).await;
    result.expect("app succeeds");
    assert_eq!(rig.line_count("app.runs"), 1);
}

/// A service's declared output is cached: captured once the service is
/// ready, and restored before the next spawn so startup work is skipped.
#[test_log::test(tokio::test)]
async fn service_output_is_captured_and_restored() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"serve": "wireit"},
        "wireit": {
            "serve": {
                "command": "[ -e out.txt ] || { tr a-z A-Z < input > out.txt; echo gen >> gen.runs; }; echo ready; sleep 60",
                "service": {"readyWhen": {"line-matches": "ready"}},
                "files": ["input"],
                "output": ["out.txt"]
            }
        }
    }));
    rig.write("input", "v0");

    // First start generates the output; once the service reports ready the
    // snapshot lands in the cache. `finish` drains the event stream, which
    // also waits out the capture task.
    let session = Session::build(&rig, "serve", ExecuteOptions::default()).await;
    let (result, _) = session.finish().await;
    result.expect("service starts");
    assert_eq!(rig.read("out.txt").as_deref(), Some("V0"));
    assert_eq!(rig.line_count("gen.runs"), 1);
    assert!(rig.exists(".wireit/state/serve"));

    // Wipe the output and the persisted fingerprint (a fresh checkout):
    // the next start restores the output from the cache before spawning,
    // so the service finds it and skips regeneration.
    std::fs::remove_file(rig.package.join("out.txt")).unwrap();
    std::fs::remove_file(rig.package.join(".wireit/state/serve")).unwrap();

    let session = Session::build(&rig, "serve", ExecuteOptions::default()).await;
    let (result, _) = session.finish().await;
    result.expect("service starts again");
    assert_eq!(rig.read("out.txt").as_deref(), Some("V0"));
    assert_eq!(rig.line_count("gen.runs"), 1, "startup work was skipped");
}

/// Repeated start requests never double-spawn: two consumers of the same
/// service observe one service process.
#[test_log::test(tokio::test)]
async fn concurrent_consumers_share_one_service() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"all": "wireit", "c1": "wireit", "c2": "wireit", "serve": "wireit"},
        "wireit": {
            "all": {"dependencies": ["c1", "c2"]},
            "c1": {"command": "echo one >> consumers.log", "dependencies": ["serve"]},
            "c2": {"command": "echo two >> consumers.log", "dependencies": ["serve"]},
            "serve": {"command": "echo spawned >> serve.log; sleep 60", "service": true}
        }
    }));

    let (result, _) = crate::execute(&rig, "all", ExecuteOptions::default()).await;
    result.expect("run succeeds");

    assert!(
        wait_until(|| rig.line_count("serve.log") == 1, Duration::from_secs(5)).await,
        "the service spawned exactly once: {:?}",
        rig.read("serve.log")
    );
    assert_eq!(rig.line_count("consumers.log"), 2);
}
