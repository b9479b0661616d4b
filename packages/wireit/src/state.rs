//! Persisted per-script state under each package's `.wireit/` directory.
//!
//! Layout:
//! - `state/<script>` -- the previous successful fingerprint string.
//! - `state/<script>.stdout` / `state/<script>.stderr` -- replay buffers
//!   captured from the last run, replayed on `fresh` and `cached` successes.
//! - `cache/<script>/<digest>/` -- the local cache backend's entries.
//! - `locks/<script>` -- advisory lock file.
//!
//! Fingerprint writes are atomic (temp-then-rename), and the previous
//! fingerprint is deleted before a command spawns so that a crash mid-run
//! can never masquerade as freshness.

use std::path::PathBuf;

use color_eyre::Result;
use tracing::instrument;

use crate::{fs::Fs, script::ScriptRef};

/// Name of the state directory inside a package.
pub const STATE_DIR: &str = ".wireit";

/// Encode a script name for use as a file name.
///
/// Script names routinely contain characters like `:` and `/`; those are
/// percent-encoded so every script maps to a distinct flat file.
pub fn script_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_' => {
                out.push(byte as char);
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02x}"));
            }
        }
    }
    out
}

/// Accessor for a package's persisted script state.
#[derive(Clone, Debug)]
pub struct StateStore {
    fs: Fs,
}

/// Captured stdout/stderr from a successful run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Replay {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl StateStore {
    pub fn new(fs: Fs) -> Self {
        Self { fs }
    }

    fn state_path(script: &ScriptRef) -> PathBuf {
        script
            .package
            .join(STATE_DIR)
            .join("state")
            .join(script_file_name(&script.name))
    }

    /// Path of this script's advisory lock file.
    pub fn lock_path(script: &ScriptRef) -> PathBuf {
        script
            .package
            .join(STATE_DIR)
            .join("locks")
            .join(script_file_name(&script.name))
    }

    /// Root of the package-local cache directory.
    pub fn cache_dir(script: &ScriptRef) -> PathBuf {
        script
            .package
            .join(STATE_DIR)
            .join("cache")
            .join(script_file_name(&script.name))
    }

    /// Read the previous successful fingerprint string, if any.
    #[instrument(skip(self))]
    pub async fn read_fingerprint(&self, script: &ScriptRef) -> Result<Option<String>> {
        self.fs.read_to_string(Self::state_path(script)).await
    }

    /// Atomically persist the fingerprint string for this script.
    #[instrument(skip(self, fingerprint))]
    pub async fn write_fingerprint(&self, script: &ScriptRef, fingerprint: &str) -> Result<()> {
        self.fs
            .write_atomic(Self::state_path(script), fingerprint.as_bytes().to_vec())
            .await
    }

    /// Delete the persisted fingerprint. Called before spawning so an
    /// interrupted run is never considered fresh.
    #[instrument(skip(self))]
    pub async fn delete_fingerprint(&self, script: &ScriptRef) -> Result<()> {
        self.fs.remove_file(Self::state_path(script)).await
    }

    /// Path of a replay buffer. A plain suffix rather than `with_extension`:
    /// script names may themselves contain dots.
    fn replay_path(script: &ScriptRef, stream: &str) -> PathBuf {
        let base = Self::state_path(script);
        let mut name = base
            .file_name()
            .expect("state path has a file name")
            .to_os_string();
        name.push(".");
        name.push(stream);
        base.with_file_name(name)
    }

    /// Read the captured replay buffers from the previous run.
    #[instrument(skip(self))]
    pub async fn read_replay(&self, script: &ScriptRef) -> Result<Replay> {
        let stdout = self.fs.read(Self::replay_path(script, "stdout")).await?;
        let stderr = self.fs.read(Self::replay_path(script, "stderr")).await?;
        Ok(Replay {
            stdout: stdout.unwrap_or_default(),
            stderr: stderr.unwrap_or_default(),
        })
    }

    /// Persist the replay buffers captured from a successful run.
    #[instrument(skip(self, replay))]
    pub async fn write_replay(&self, script: &ScriptRef, replay: &Replay) -> Result<()> {
        self.fs
            .write_atomic(Self::replay_path(script, "stdout"), replay.stdout.clone())
            .await?;
        self.fs
            .write_atomic(Self::replay_path(script, "stderr"), replay.stderr.clone())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn script_names_map_to_distinct_flat_files() {
        assert_eq!(script_file_name("build"), "build");
        assert_eq!(script_file_name("build:ts"), "build%3ats");
        assert_ne!(script_file_name("a/b"), script_file_name("a%2fb"));
    }

    #[tokio::test]
    async fn fingerprint_round_trip_and_delete() {
        let temp = tempfile::tempdir().unwrap();
        let store = StateStore::new(Fs::default());
        let script = ScriptRef::new(temp.path(), "build");

        assert_eq!(store.read_fingerprint(&script).await.unwrap(), None);
        store.write_fingerprint(&script, "{}").await.unwrap();
        assert_eq!(
            store.read_fingerprint(&script).await.unwrap().as_deref(),
            Some("{}")
        );
        store.delete_fingerprint(&script).await.unwrap();
        assert_eq!(store.read_fingerprint(&script).await.unwrap(), None);
    }
}
