//! Watch-mode scenarios.
#![cfg(unix)]

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use wireit::{
    analyzer::Analyzer,
    event,
    fs::Fs,
    manifest::ManifestReader,
    watcher::{self, WatchOptions},
};

use crate::{TestRig, wait_until};

/// Watch idempotence: the initial run happens unconditionally, and a burst
/// of changes within the debounce window causes exactly one rerun.
#[test_log::test(tokio::test)]
async fn burst_of_changes_coalesces_into_one_rerun() {
    let rig = TestRig::new();
    rig.manifest(json!({
        "scripts": {"build": "wireit"},
        "wireit": {
            "build": {
                "command": "echo ran >> build.runs",
                "files": ["input"],
                "output": []
            }
        }
    }));
    rig.write("input", "v0");

    let fs = Fs::default();
    let analyzer = Analyzer::new(ManifestReader::new(fs.clone()), fs.clone());
    let (events, mut receiver) = event::channel();
    // Drain events in the background; this test watches the filesystem.
    let drain = tokio::spawn(async move { while receiver.recv().await.is_some() {} });

    let cancel = CancellationToken::new();
    let root = rig.script("build");
    let watch_task = {
        let cancel = cancel.clone();
        let root = root.clone();
        tokio::spawn(async move {
            watcher::watch(
                &analyzer,
                &fs,
                None,
                &events,
                &root,
                &[],
                WatchOptions::default(),
                cancel,
            )
            .await
        })
    };

    // The initial run happens without any change.
    assert!(
        wait_until(|| rig.line_count("build.runs") == 1, Duration::from_secs(10)).await,
        "initial run happened"
    );

    // Let the first iteration finish persisting state, then burst.
    tokio::time::sleep(Duration::from_millis(300)).await;
    rig.write("input", "v1");
    rig.write("input", "v2");
    rig.write("input", "v3");

    assert!(
        wait_until(|| rig.line_count("build.runs") >= 2, Duration::from_secs(10)).await,
        "a rerun happened"
    );
    // Give any extra (buggy) reruns time to show up, then assert there was
    // exactly one.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(rig.line_count("build.runs"), 2);

    cancel.cancel();
    watch_task
        .await
        .expect("join watch task")
        .expect("watch exits cleanly on abort");
    drain.abort();
}

/// Known failures don't terminate the loop: a broken manifest is
/// re-analyzed after a fix, and the script then runs.
#[test_log::test(tokio::test)]
async fn watch_survives_manifest_errors() {
    let rig = TestRig::new();
    rig.write("package.json", "{ this is not json");
    rig.write("input", "v0");

    let fs = Fs::default();
    let analyzer = Analyzer::new(ManifestReader::new(fs.clone()), fs.clone());
    let (events, mut receiver) = event::channel();
    let drain = tokio::spawn(async move { while receiver.recv().await.is_some() {} });

    let cancel = CancellationToken::new();
    let root = rig.script("build");
    let watch_task = {
        let cancel = cancel.clone();
        let root = root.clone();
        tokio::spawn(async move {
            watcher::watch(
                &analyzer,
                &fs,
                None,
                &events,
                &root,
                &[],
                WatchOptions::default(),
                cancel,
            )
            .await
        })
    };

    // Give the failing iteration time to settle, then fix the manifest.
    tokio::time::sleep(Duration::from_millis(300)).await;
    rig.manifest(json!({
        "scripts": {"build": "wireit"},
        "wireit": {
            "build": {
                "command": "echo ran >> build.runs",
                "files": ["input"],
                "output": []
            }
        }
    }));

    assert!(
        wait_until(|| rig.line_count("build.runs") == 1, Duration::from_secs(10)).await,
        "the loop recovered after the manifest was fixed"
    );

    cancel.cancel();
    watch_task
        .await
        .expect("join watch task")
        .expect("watch exits cleanly on abort");
    drain.abort();
}
